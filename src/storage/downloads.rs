//! Model downloads
//!
//! Fetches GGUF files (typically from HuggingFace Hub) into the models
//! directory. Several downloads may run at once; each is tracked by its local
//! file name so the same file is never fetched twice concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

const HF_BASE: &str = "https://huggingface.co";
const USER_AGENT: &str = concat!("localchat/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Invalid model URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid model filename")]
    InvalidFileName,

    #[error("{0} is already downloading")]
    AlreadyInProgress(String),

    #[error("No GGUF files found in this repository")]
    NoGgufFiles,

    #[error("Multiple GGUF files found. Please specify one of: {}", .0.join(", "))]
    AmbiguousFiles(Vec<String>),

    #[error("Download failed with status: {0}")]
    Status(u16),

    #[error("Download incomplete: got {got} bytes, expected {expected}")]
    Incomplete { got: u64, expected: u64 },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reports `(downloaded, total)` bytes; total is unknown without Content-Length
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Parsed HuggingFace model reference
#[derive(Debug, Clone, PartialEq)]
pub struct HuggingFaceUrl {
    pub repo_id: String,
    pub filename: String,
    pub revision: String,
}

impl HuggingFaceUrl {
    /// Parse various HuggingFace URL formats
    pub fn parse(url: &str) -> Result<Self, DownloadError> {
        // Accepted forms:
        // 1. https://huggingface.co/username/repo/blob/main/model.gguf
        // 2. https://huggingface.co/username/repo/resolve/main/model.gguf
        // 3. username/repo/model.gguf
        // 4. username/repo

        let url = url.trim();
        let url = url.split('?').next().unwrap_or(url);
        let url = url.split('#').next().unwrap_or(url);

        if url.contains("huggingface.co") {
            let path = url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_start_matches("huggingface.co/");

            let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
            if parts.len() < 2 {
                return Err(DownloadError::InvalidUrl(url.to_string()));
            }
            let repo_id = format!("{}/{}", parts[0], parts[1]);

            if let Some(pos) = parts.iter().position(|&p| p == "blob" || p == "resolve") {
                if parts.len() > pos + 2 {
                    return Ok(Self {
                        repo_id,
                        filename: parts[pos + 2..].join("/"),
                        revision: parts[pos + 1].to_string(),
                    });
                }
            }

            return Ok(Self {
                repo_id,
                filename: String::new(),
                revision: "main".to_string(),
            });
        }

        let parts: Vec<&str> = url.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() >= 2 {
            return Ok(Self {
                repo_id: format!("{}/{}", parts[0], parts[1]),
                filename: parts[2..].join("/"),
                revision: "main".to_string(),
            });
        }

        Err(DownloadError::InvalidUrl(url.to_string()))
    }

    /// Direct download URL for `filename`
    pub fn download_url(&self, filename: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            HF_BASE, self.repo_id, self.revision, filename
        )
    }
}

/// Turn a remote file path into a safe local file name
pub fn sanitize_local_filename(filename: &str) -> Result<String, DownloadError> {
    let trimmed = filename.trim();
    let no_query = trimmed.split('?').next().unwrap_or(trimmed);
    let no_fragment = no_query.split('#').next().unwrap_or(no_query);
    let no_leading = no_fragment.trim_start_matches('/');

    let flattened = no_leading.replace('\\', "/").replace('/', "__");

    let mut sanitized: String = flattened
        .chars()
        .map(|ch| {
            let invalid = matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*');
            if invalid || ch.is_control() {
                '_'
            } else {
                ch
            }
        })
        .collect();

    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        return Err(DownloadError::InvalidFileName);
    }
    Ok(sanitized)
}

/// Get a human-readable size string
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    dest.with_file_name(name)
}

/// Transfers one remote file to a local path
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path, progress: ProgressFn)
        -> Result<(), DownloadError>;
}

/// Streams over HTTP into `<dest>.tmp`, then renames into place
#[derive(Debug, Clone)]
pub struct HttpModelFetcher {
    client: reqwest::Client,
}

impl Default for HttpModelFetcher {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(3600))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl HttpModelFetcher {
    /// List GGUF files in a HuggingFace repository
    pub async fn list_gguf_files(&self, repo_id: &str) -> Result<Vec<String>, DownloadError> {
        #[derive(serde::Deserialize)]
        struct FileInfo {
            path: String,
        }

        let api_url = format!("{}/api/models/{}/tree/main", HF_BASE, repo_id);
        let response = self.client.get(&api_url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status().as_u16()));
        }

        let files: Vec<FileInfo> = response.json().await?;
        Ok(files
            .into_iter()
            .filter(|f| f.path.ends_with(".gguf"))
            .map(|f| f.path)
            .collect())
    }

    /// Resolve user input to `(local file name, download URL)`
    pub async fn resolve_hub_reference(
        &self,
        input: &str,
    ) -> Result<(String, String), DownloadError> {
        let hf = HuggingFaceUrl::parse(input)?;
        let filename = if hf.filename.is_empty() {
            let mut files = self.list_gguf_files(&hf.repo_id).await?;
            match files.len() {
                0 => return Err(DownloadError::NoGgufFiles),
                1 => files.remove(0),
                _ => return Err(DownloadError::AmbiguousFiles(files)),
            }
        } else {
            hf.filename.clone()
        };
        Ok((sanitize_local_filename(&filename)?, hf.download_url(&filename)))
    }
}

#[async_trait]
impl ModelFetcher for HttpModelFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn,
    ) -> Result<(), DownloadError> {
        tracing::info!("Downloading from: {}", url);
        let mut response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status().as_u16()));
        }

        let total = response.content_length();
        if let Some(total) = total {
            tracing::info!("File size: {}", format_size(total));
        }

        let temp = temp_path(dest);
        let mut file = File::create(&temp).await?;
        let mut downloaded: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress(downloaded, total);
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = total.filter(|&t| t != downloaded) {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(DownloadError::Incomplete {
                got: downloaded,
                expected,
            });
        }

        tokio::fs::rename(&temp, dest).await?;
        tracing::info!("Download complete: {}", dest.display());
        Ok(())
    }
}

type RescanFn = Arc<dyn Fn() + Send + Sync>;

/// Tracks concurrent downloads into the models directory
#[derive(Clone)]
pub struct DownloadCoordinator {
    fetcher: Arc<dyn ModelFetcher>,
    models_dir: PathBuf,
    active: Arc<Mutex<HashMap<String, f32>>>,
    on_complete: Option<RescanFn>,
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("models_dir", &self.models_dir)
            .field("active", &self.active())
            .finish()
    }
}

impl DownloadCoordinator {
    pub fn new(fetcher: Arc<dyn ModelFetcher>, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            models_dir: models_dir.into(),
            active: Arc::new(Mutex::new(HashMap::new())),
            on_complete: None,
        }
    }

    /// Run `rescan` after every successful download
    pub fn with_rescan(mut self, rescan: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(rescan));
        self
    }

    /// In-flight downloads and their progress in `0.0..=1.0`, sorted by name
    pub fn active(&self) -> Vec<(String, f32)> {
        let active = self.active.lock().expect("download state mutex poisoned");
        let mut list: Vec<_> = active.iter().map(|(k, v)| (k.clone(), *v)).collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    pub fn progress(&self, name: &str) -> Option<f32> {
        self.active
            .lock()
            .expect("download state mutex poisoned")
            .get(name)
            .copied()
    }

    /// Start downloading `url` to `<models dir>/<name>`
    ///
    /// Refuses a name that is already downloading. An existing non-empty file
    /// is returned as is.
    pub fn start(
        &self,
        name: &str,
        url: &str,
    ) -> Result<JoinHandle<Result<PathBuf, DownloadError>>, DownloadError> {
        let name = sanitize_local_filename(name)?;
        {
            let mut active = self.active.lock().expect("download state mutex poisoned");
            if active.contains_key(&name) {
                return Err(DownloadError::AlreadyInProgress(name));
            }
            active.insert(name.clone(), 0.0);
        }

        let this = self.clone();
        let url = url.to_string();
        Ok(tokio::spawn(async move {
            let result = this.run(&name, &url).await;
            this.active
                .lock()
                .expect("download state mutex poisoned")
                .remove(&name);
            match &result {
                Ok(path) => {
                    if let Some(rescan) = &this.on_complete {
                        rescan();
                    }
                    tracing::info!("Model ready: {}", path.display());
                }
                Err(e) => tracing::error!("Download of {} failed: {}", name, e),
            }
            result
        }))
    }

    async fn run(&self, name: &str, url: &str) -> Result<PathBuf, DownloadError> {
        tokio::fs::create_dir_all(&self.models_dir).await?;
        let dest = self.models_dir.join(name);

        if let Ok(meta) = tokio::fs::metadata(&dest).await {
            if meta.len() > 0 {
                tracing::info!("Model already exists: {}", dest.display());
                return Ok(dest);
            }
        }

        let active = Arc::clone(&self.active);
        let key = name.to_string();
        let progress: ProgressFn = Arc::new(move |done, total| {
            let fraction = match total {
                Some(total) if total > 0 => (done as f64 / total as f64).clamp(0.0, 1.0) as f32,
                _ => 0.0,
            };
            if let Some(entry) = active
                .lock()
                .expect("download state mutex poisoned")
                .get_mut(&key)
            {
                *entry = fraction;
            }
        });

        self.fetcher.fetch(url, &dest, progress).await?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Writes a fixed body in two halves, pausing on `gate` in between
    struct FakeFetcher {
        body: Vec<u8>,
        gate: Arc<Notify>,
        fail: bool,
    }

    #[async_trait]
    impl ModelFetcher for FakeFetcher {
        async fn fetch(
            &self,
            _url: &str,
            dest: &Path,
            progress: ProgressFn,
        ) -> Result<(), DownloadError> {
            let total = self.body.len() as u64;
            progress(total / 2, Some(total));
            self.gate.notified().await;
            if self.fail {
                return Err(DownloadError::Status(404));
            }
            tokio::fs::write(dest, &self.body).await?;
            progress(total, Some(total));
            Ok(())
        }
    }

    fn coordinator(dir: &Path, fail: bool) -> (DownloadCoordinator, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let fetcher = FakeFetcher {
            body: b"GGUF model bytes".to_vec(),
            gate: Arc::clone(&gate),
            fail,
        };
        (DownloadCoordinator::new(Arc::new(fetcher), dir), gate)
    }

    async fn wait_for_progress(coord: &DownloadCoordinator, name: &str, value: f32) {
        for _ in 0..100 {
            if coord.progress(name) == Some(value) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("progress for {name} never reached {value}");
    }

    #[test]
    fn test_parse_hf_url_full() {
        let url = "https://huggingface.co/TheBloke/Llama-2-7B-GGUF/blob/main/llama-2-7b.Q4_K_M.gguf";
        let parsed = HuggingFaceUrl::parse(url).unwrap();
        assert_eq!(parsed.repo_id, "TheBloke/Llama-2-7B-GGUF");
        assert_eq!(parsed.filename, "llama-2-7b.Q4_K_M.gguf");
        assert_eq!(parsed.revision, "main");
        assert_eq!(
            parsed.download_url(&parsed.filename),
            "https://huggingface.co/TheBloke/Llama-2-7B-GGUF/resolve/main/llama-2-7b.Q4_K_M.gguf"
        );
    }

    #[test]
    fn test_parse_hf_url_short_and_repo_only() {
        let parsed = HuggingFaceUrl::parse("TheBloke/Llama-2-7B-GGUF/llama-2-7b.Q4_K_M.gguf").unwrap();
        assert_eq!(parsed.repo_id, "TheBloke/Llama-2-7B-GGUF");
        assert_eq!(parsed.filename, "llama-2-7b.Q4_K_M.gguf");

        let parsed = HuggingFaceUrl::parse("TheBloke/Llama-2-7B-GGUF").unwrap();
        assert_eq!(parsed.filename, "");
        assert!(HuggingFaceUrl::parse("just-a-name").is_err());
    }

    #[test]
    fn test_sanitize_local_filename() {
        assert_eq!(
            sanitize_local_filename("sub/dir/model.gguf?download=1").unwrap(),
            "sub__dir__model.gguf"
        );
        assert_eq!(sanitize_local_filename("a:b*c.gguf. ").unwrap(), "a_b_c.gguf");
        assert!(sanitize_local_filename("  ").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[tokio::test]
    async fn test_duplicate_download_refused() {
        let dir = tempfile::tempdir().unwrap();
        let rescans = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&rescans);
        let (coord, gate) = coordinator(dir.path(), false);
        let coord = coord.with_rescan(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handle = coord.start("model.gguf", "http://x/model.gguf").unwrap();
        wait_for_progress(&coord, "model.gguf", 0.5).await;

        let err = coord.start("model.gguf", "http://x/model.gguf").unwrap_err();
        assert!(matches!(err, DownloadError::AlreadyInProgress(_)));
        assert_eq!(coord.active(), vec![("model.gguf".to_string(), 0.5)]);

        gate.notify_one();
        let path = handle.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"GGUF model bytes");
        assert!(coord.active().is_empty());
        assert_eq!(rescans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_download_clears_state() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, gate) = coordinator(dir.path(), true);

        let handle = coord.start("broken.gguf", "http://x/broken.gguf").unwrap();
        wait_for_progress(&coord, "broken.gguf", 0.5).await;
        gate.notify_one();

        assert!(matches!(handle.await.unwrap(), Err(DownloadError::Status(404))));
        assert!(coord.progress("broken.gguf").is_none());
        assert!(!dir.path().join("broken.gguf").exists());
        // A retry is accepted once the first attempt has finished
        assert!(coord.start("broken.gguf", "http://x/broken.gguf").is_ok());
    }

    #[tokio::test]
    async fn test_existing_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("have.gguf"), b"GGUF").unwrap();
        let (coord, _gate) = coordinator(dir.path(), false);

        let path = coord
            .start("have.gguf", "http://x/have.gguf")
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"GGUF");
    }

    #[tokio::test]
    async fn test_http_fetcher_streams_to_file() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let body = b"GGUF0123456789";
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(body).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("m.gguf");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |done, total| {
            record.lock().unwrap().push((done, total));
        });

        let fetcher = HttpModelFetcher {
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
        };
        fetcher
            .fetch(&format!("http://127.0.0.1:{}/m.gguf", port), &dest, progress)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"GGUF0123456789");
        assert!(!temp_path(&dest).exists());
        assert_eq!(seen.lock().unwrap().last(), Some(&(14, Some(14))));
    }
}
