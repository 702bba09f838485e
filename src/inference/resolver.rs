//! Executable discovery
//!
//! Locates a llama.cpp CLI or server binary across an ordered list of
//! candidate locations. The list is plain data built from an injected
//! environment and filesystem, so resolution can be exercised without a real
//! installation.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::inference::process::run_with_timeout;

/// Versioned package-manager installs checked per prefix
const MAX_CELLAR_VERSIONS: usize = 3;

/// Deadline for a `--version` probe
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Which llama.cpp binary to look for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutableKind {
    Cli,
    Server,
}

impl ExecutableKind {
    /// Basenames tried in installed locations
    pub fn basenames(self) -> &'static [&'static str] {
        match self {
            ExecutableKind::Cli => &["llama-cli", "llama"],
            ExecutableKind::Server => &["llama-server"],
        }
    }

    /// Basenames tried in source-build directories (older builds name the CLI `main`)
    fn local_build_basenames(self) -> &'static [&'static str] {
        match self {
            ExecutableKind::Cli => &["llama-cli", "llama", "main"],
            ExecutableKind::Server => &["llama-server"],
        }
    }

    /// Environment variable holding an explicit override
    pub fn env_var(self) -> &'static str {
        match self {
            ExecutableKind::Cli => "LLAMACPP_CLI",
            ExecutableKind::Server => "LLAMACPP_SERVER",
        }
    }
}

impl fmt::Display for ExecutableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutableKind::Cli => write!(f, "llama.cpp CLI"),
            ExecutableKind::Server => write!(f, "llama.cpp server"),
        }
    }
}

/// Where a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Override,
    Managed,
    PackageManager,
    LocalBuild,
    Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub source: CandidateSource,
}

/// Why a candidate was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotFound,
    NotExecutable,
    VersionStatus(i32),
    ProbeError(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotFound => write!(f, "not found"),
            Rejection::NotExecutable => write!(f, "not executable"),
            Rejection::VersionStatus(code) => write!(f, "--version exited with status {}", code),
            Rejection::ProbeError(e) => write!(f, "probe error: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub path: PathBuf,
    pub source: CandidateSource,
    pub rejection: Rejection,
}

/// Every candidate tried, in search order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveReport {
    pub kind: ExecutableKind,
    pub entries: Vec<ReportEntry>,
}

impl fmt::Display for ResolveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Searched for {}:", self.kind)?;
        for entry in &self.entries {
            writeln!(f, "  {} => {}", entry.path.display(), entry.rejection)?;
        }
        write!(
            f,
            "Set {} to the binary path or install llama.cpp.",
            self.kind.env_var()
        )
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{0}")]
    NotFound(ResolveReport),
}

impl From<ResolveError> for crate::inference::EngineError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound(report) => crate::inference::EngineError::ExecutableNotFound(report),
        }
    }
}

// ============================================================================
// Injected environment
// ============================================================================

/// Filesystem queries used during resolution
pub trait FileSystem: Send + Sync {
    fn is_file(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn is_executable(&self, path: &Path) -> bool;
    /// Names of the entries of a directory, empty when unreadable
    fn list_dir(&self, path: &Path) -> Vec<String>;
}

/// The real filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_executable(&self, path: &Path) -> bool {
        is_executable_file(path)
    }

    fn list_dir(&self, path: &Path) -> Vec<String> {
        std::fs::read_dir(path)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(unix)]
pub(crate) fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub(crate) fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

/// Outcome of running `<candidate> --version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Passed,
    Status(i32),
    Failed(String),
}

#[async_trait]
pub trait VersionProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> ProbeOutcome;
}

/// Runs the candidate with `--version` under a deadline
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandVersionProbe;

#[async_trait]
impl VersionProbe for CommandVersionProbe {
    async fn probe(&self, path: &Path) -> ProbeOutcome {
        let args = vec!["--version".to_string()];
        match run_with_timeout(path, &args, &[], VERSION_PROBE_TIMEOUT).await {
            Ok(out) if out.success() => ProbeOutcome::Passed,
            Ok(out) => ProbeOutcome::Status(out.code.unwrap_or(-1)),
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        }
    }
}

/// Inputs that decide the candidate list
#[derive(Debug, Clone, Default)]
pub struct ResolverEnv {
    /// Path from user settings, tried first
    pub setting_override: Option<String>,
    /// Value of the `LLAMACPP_*` environment variable
    pub env_override: Option<String>,
    /// Application data directory holding the managed runtime copy
    pub data_dir: Option<PathBuf>,
    /// Package-manager prefixes, in priority order
    pub package_prefixes: Vec<PathBuf>,
    /// Source-build output directories, in priority order
    pub local_build_dirs: Vec<PathBuf>,
    /// Raw `PATH`
    pub path_var: Option<OsString>,
}

impl ResolverEnv {
    /// Environment of the current process
    pub fn from_process(kind: ExecutableKind, setting_override: Option<String>) -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let mut local_build_dirs = vec![
            PathBuf::from("/tmp/llama.cpp/build/bin"),
            PathBuf::from("/tmp/llama.cpp/bin"),
            PathBuf::from("/tmp/llama.cpp"),
        ];
        if let Some(home) = home {
            local_build_dirs.push(home.join("llama.cpp/build/bin"));
        }

        Self {
            setting_override,
            env_override: std::env::var(kind.env_var()).ok(),
            data_dir: crate::storage::get_data_dir().ok(),
            package_prefixes: default_package_prefixes(),
            local_build_dirs,
            path_var: std::env::var_os("PATH"),
        }
    }
}

pub fn default_package_prefixes() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/opt/homebrew"),
        PathBuf::from("/usr/local"),
        PathBuf::from("/home/linuxbrew/.linuxbrew"),
    ]
}

// ============================================================================
// Resolver
// ============================================================================

pub struct ExecutableResolver {
    kind: ExecutableKind,
    env: ResolverEnv,
    fs: Arc<dyn FileSystem>,
    probe: Option<Arc<dyn VersionProbe>>,
}

impl ExecutableResolver {
    /// Resolver over the real filesystem with `--version` probing
    pub fn new(kind: ExecutableKind, env: ResolverEnv) -> Self {
        Self {
            kind,
            env,
            fs: Arc::new(RealFileSystem),
            probe: Some(Arc::new(CommandVersionProbe)),
        }
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Replace (or disable with `None`) the version probe
    pub fn with_probe(mut self, probe: Option<Arc<dyn VersionProbe>>) -> Self {
        self.probe = probe;
        self
    }

    pub fn kind(&self) -> ExecutableKind {
        self.kind
    }

    /// Ordered, de-duplicated candidate list
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut out = Vec::new();
        let names = self.kind.basenames();

        for value in [&self.env.setting_override, &self.env.env_override]
            .into_iter()
            .flatten()
        {
            self.push_override(&mut out, value);
        }

        if let Some(data_dir) = &self.env.data_dir {
            for dir in [data_dir.join("runtime").join("bin"), data_dir.join("bin")] {
                push_names(&mut out, &dir, names, CandidateSource::Managed);
            }
        }

        for prefix in &self.env.package_prefixes {
            push_names(
                &mut out,
                &prefix.join("opt").join("llama.cpp").join("bin"),
                names,
                CandidateSource::PackageManager,
            );
            push_names(&mut out, &prefix.join("bin"), names, CandidateSource::PackageManager);

            let cellar = prefix.join("Cellar").join("llama.cpp");
            for version in newest_versions(self.fs.list_dir(&cellar), MAX_CELLAR_VERSIONS) {
                for sub in ["bin", "libexec"] {
                    push_names(
                        &mut out,
                        &cellar.join(&version).join(sub),
                        names,
                        CandidateSource::PackageManager,
                    );
                }
            }
        }

        for dir in &self.env.local_build_dirs {
            push_names(
                &mut out,
                dir,
                self.kind.local_build_basenames(),
                CandidateSource::LocalBuild,
            );
        }

        for dir in self.path_dirs() {
            push_names(&mut out, &dir, names, CandidateSource::Path);
        }

        let mut seen = HashSet::new();
        out.retain(|c| seen.insert(c.path.clone()));
        out
    }

    fn push_override(&self, out: &mut Vec<Candidate>, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        let path = PathBuf::from(value);
        if self.fs.is_dir(&path) {
            push_names(out, &path, self.kind.basenames(), CandidateSource::Override);
        } else if path.is_absolute() || value.contains(std::path::MAIN_SEPARATOR) {
            out.push(Candidate {
                path,
                source: CandidateSource::Override,
            });
        } else {
            for dir in self.path_dirs() {
                out.push(Candidate {
                    path: dir.join(value),
                    source: CandidateSource::Override,
                });
            }
        }
    }

    fn path_dirs(&self) -> Vec<PathBuf> {
        self.env
            .path_var
            .as_ref()
            .map(|p| std::env::split_paths(p).filter(|d| !d.as_os_str().is_empty()).collect())
            .unwrap_or_default()
    }

    /// First usable candidate, or a report of every rejection
    pub async fn resolve(&self) -> Result<PathBuf, ResolveError> {
        let candidates = self.candidates();
        tracing::debug!("Resolving {} over {} candidates", self.kind, candidates.len());

        let mut entries = Vec::new();
        for candidate in candidates {
            let rejection = match self.check(&candidate.path).await {
                None => {
                    tracing::info!("Resolved {}: {}", self.kind, candidate.path.display());
                    return Ok(candidate.path);
                }
                Some(rejection) => rejection,
            };
            entries.push(ReportEntry {
                path: candidate.path,
                source: candidate.source,
                rejection,
            });
        }

        tracing::warn!("No usable {} found ({} candidates)", self.kind, entries.len());
        Err(ResolveError::NotFound(ResolveReport {
            kind: self.kind,
            entries,
        }))
    }

    async fn check(&self, path: &Path) -> Option<Rejection> {
        if !self.fs.is_file(path) {
            return Some(Rejection::NotFound);
        }
        if !self.fs.is_executable(path) {
            return Some(Rejection::NotExecutable);
        }
        match &self.probe {
            None => None,
            Some(probe) => match probe.probe(path).await {
                ProbeOutcome::Passed => None,
                ProbeOutcome::Status(code) => Some(Rejection::VersionStatus(code)),
                ProbeOutcome::Failed(e) => Some(Rejection::ProbeError(e)),
            },
        }
    }
}

fn push_names(out: &mut Vec<Candidate>, dir: &Path, names: &[&str], source: CandidateSource) {
    for name in names {
        out.push(Candidate {
            path: dir.join(name),
            source,
        });
    }
}

/// The `limit` newest version directory names, newest first
pub fn newest_versions(mut versions: Vec<String>, limit: usize) -> Vec<String> {
    versions.sort_by(|a, b| compare_versions(b, a));
    versions.truncate(limit);
    versions
}

/// Natural ordering: numeric runs compare as numbers ("10" > "9")
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn numbers(s: &str) -> Vec<u64> {
        s.split(|c: char| !c.is_ascii_digit())
            .filter(|p| !p.is_empty())
            .map(|p| p.parse().unwrap_or(u64::MAX))
            .collect()
    }
    numbers(a).cmp(&numbers(b)).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory filesystem: files map to their executable bit
    #[derive(Default)]
    struct FakeFs {
        files: HashMap<PathBuf, bool>,
        dirs: HashMap<PathBuf, Vec<String>>,
    }

    impl FakeFs {
        fn file(mut self, path: &str, executable: bool) -> Self {
            self.files.insert(PathBuf::from(path), executable);
            self
        }

        fn dir(mut self, path: &str, entries: &[&str]) -> Self {
            self.dirs.insert(
                PathBuf::from(path),
                entries.iter().map(|s| s.to_string()).collect(),
            );
            self
        }
    }

    impl FileSystem for FakeFs {
        fn is_file(&self, path: &Path) -> bool {
            self.files.contains_key(path)
        }
        fn is_dir(&self, path: &Path) -> bool {
            self.dirs.contains_key(path)
        }
        fn is_executable(&self, path: &Path) -> bool {
            self.files.get(path).copied().unwrap_or(false)
        }
        fn list_dir(&self, path: &Path) -> Vec<String> {
            self.dirs.get(path).cloned().unwrap_or_default()
        }
    }

    /// Probe answering from a table and recording calls
    #[derive(Default)]
    struct FakeProbe {
        failing: HashMap<PathBuf, i32>,
        calls: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl VersionProbe for FakeProbe {
        async fn probe(&self, path: &Path) -> ProbeOutcome {
            self.calls.lock().unwrap().push(path.to_path_buf());
            match self.failing.get(path) {
                Some(code) => ProbeOutcome::Status(*code),
                None => ProbeOutcome::Passed,
            }
        }
    }

    fn env() -> ResolverEnv {
        ResolverEnv {
            setting_override: None,
            env_override: None,
            data_dir: Some(PathBuf::from("/data")),
            package_prefixes: vec![PathBuf::from("/opt/homebrew"), PathBuf::from("/usr/local")],
            local_build_dirs: vec![PathBuf::from("/tmp/llama.cpp/build/bin")],
            path_var: Some(OsString::from("/usr/bin:/bin")),
        }
    }

    fn resolver(kind: ExecutableKind, env: ResolverEnv, fs: FakeFs) -> ExecutableResolver {
        ExecutableResolver::new(kind, env)
            .with_filesystem(Arc::new(fs))
            .with_probe(None)
    }

    #[tokio::test]
    async fn test_empty_environment_reports_every_candidate_once() {
        let r = resolver(ExecutableKind::Cli, env(), FakeFs::default());
        let candidates: Vec<PathBuf> = r.candidates().into_iter().map(|c| c.path).collect();

        let err = r.resolve().await.unwrap_err();
        let ResolveError::NotFound(report) = err;
        let reported: Vec<PathBuf> = report.entries.iter().map(|e| e.path.clone()).collect();

        assert_eq!(reported, candidates);
        let unique: HashSet<_> = reported.iter().collect();
        assert_eq!(unique.len(), reported.len());
        assert!(report
            .entries
            .iter()
            .all(|e| e.rejection == Rejection::NotFound));

        assert_eq!(reported[0], PathBuf::from("/data/runtime/bin/llama-cli"));
        assert_eq!(reported.last().unwrap(), &PathBuf::from("/bin/llama"));
        let text = report.to_string();
        assert!(text.contains("/opt/homebrew/opt/llama.cpp/bin/llama-cli => not found"));
        assert!(text.contains("LLAMACPP_CLI"));
    }

    #[test]
    fn test_search_order_by_source() {
        let r = resolver(ExecutableKind::Cli, env(), FakeFs::default());
        let sources: Vec<CandidateSource> = r.candidates().into_iter().map(|c| c.source).collect();
        let rank = |s: &CandidateSource| match s {
            CandidateSource::Override => 0,
            CandidateSource::Managed => 1,
            CandidateSource::PackageManager => 2,
            CandidateSource::LocalBuild => 3,
            CandidateSource::Path => 4,
        };
        assert!(sources.windows(2).all(|w| rank(&w[0]) <= rank(&w[1])));
        assert!(sources.contains(&CandidateSource::LocalBuild));
    }

    #[test]
    fn test_path_duplicates_removed() {
        let mut e = env();
        e.path_var = Some(OsString::from("/opt/homebrew/bin:/usr/bin"));
        let r = resolver(ExecutableKind::Server, e, FakeFs::default());
        let paths: Vec<PathBuf> = r.candidates().into_iter().map(|c| c.path).collect();
        let hits = paths
            .iter()
            .filter(|p| **p == PathBuf::from("/opt/homebrew/bin/llama-server"))
            .count();
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn test_override_directory_expands_to_basenames() {
        let mut e = env();
        e.env_override = Some("/custom".to_string());
        let fs = FakeFs::default()
            .dir("/custom", &["llama"])
            .file("/custom/llama", true)
            .file("/opt/homebrew/bin/llama-cli", true);
        let r = resolver(ExecutableKind::Cli, e, fs);
        assert_eq!(r.resolve().await.unwrap(), PathBuf::from("/custom/llama"));
    }

    #[tokio::test]
    async fn test_setting_override_beats_env() {
        let mut e = env();
        e.setting_override = Some("/from/settings/llama-cli".to_string());
        e.env_override = Some("/from/env/llama-cli".to_string());
        let fs = FakeFs::default()
            .file("/from/settings/llama-cli", true)
            .file("/from/env/llama-cli", true);
        let r = resolver(ExecutableKind::Cli, e, fs);
        assert_eq!(
            r.resolve().await.unwrap(),
            PathBuf::from("/from/settings/llama-cli")
        );
    }

    #[tokio::test]
    async fn test_bare_override_uses_path() {
        let mut e = env();
        e.env_override = Some("my-llama".to_string());
        let fs = FakeFs::default().file("/bin/my-llama", true);
        let r = resolver(ExecutableKind::Cli, e, fs);
        assert_eq!(r.resolve().await.unwrap(), PathBuf::from("/bin/my-llama"));
    }

    #[tokio::test]
    async fn test_non_executable_is_skipped() {
        let fs = FakeFs::default()
            .file("/opt/homebrew/opt/llama.cpp/bin/llama-server", false)
            .file("/usr/local/bin/llama-server", true);
        let r = resolver(ExecutableKind::Server, env(), fs);
        assert_eq!(
            r.resolve().await.unwrap(),
            PathBuf::from("/usr/local/bin/llama-server")
        );
    }

    #[tokio::test]
    async fn test_failed_version_probe_falls_through() {
        let fs = FakeFs::default()
            .file("/opt/homebrew/bin/llama-cli", true)
            .file("/usr/bin/llama-cli", true);
        let mut probe = FakeProbe::default();
        probe
            .failing
            .insert(PathBuf::from("/opt/homebrew/bin/llama-cli"), 1);
        let probe = Arc::new(probe);
        let r = ExecutableResolver::new(ExecutableKind::Cli, env())
            .with_filesystem(Arc::new(fs))
            .with_probe(Some(probe.clone()));

        assert_eq!(r.resolve().await.unwrap(), PathBuf::from("/usr/bin/llama-cli"));
        assert_eq!(probe.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_cellar_newest_three_versions() {
        let fs = FakeFs::default().dir(
            "/opt/homebrew/Cellar/llama.cpp",
            &["9", "10", "2", "1"],
        );
        let r = resolver(ExecutableKind::Server, env(), fs);
        let cellar: Vec<String> = r
            .candidates()
            .into_iter()
            .map(|c| c.path.display().to_string())
            .filter(|p| p.contains("Cellar"))
            .collect();
        assert_eq!(
            cellar,
            vec![
                "/opt/homebrew/Cellar/llama.cpp/10/bin/llama-server",
                "/opt/homebrew/Cellar/llama.cpp/10/libexec/llama-server",
                "/opt/homebrew/Cellar/llama.cpp/9/bin/llama-server",
                "/opt/homebrew/Cellar/llama.cpp/9/libexec/llama-server",
                "/opt/homebrew/Cellar/llama.cpp/2/bin/llama-server",
                "/opt/homebrew/Cellar/llama.cpp/2/libexec/llama-server",
            ]
        );
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("b4567", "b999"), Ordering::Greater);
        assert_eq!(compare_versions("1.10.0", "1.9.3"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2"), Ordering::Equal);
        assert_eq!(
            newest_versions(vec!["1".into(), "3".into(), "2".into(), "4".into()], 3),
            vec!["4", "3", "2"]
        );
    }
}
