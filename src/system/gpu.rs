//! GPU acceleration detection
//!
//! Decides whether llama.cpp can offload to the GPU on this machine and where
//! its kernel resources live, and maps that to launch flags.

use std::path::{Path, PathBuf};

/// Acceleration libraries shipped by llama.cpp builds
const ACCELERATION_LIBRARIES: &[&str] = &[
    "libggml-metal.dylib",
    "libggml-cuda.so",
    "libggml-vulkan.so",
];

/// Shared library directories checked for acceleration libraries
const LIBRARY_DIRS: &[&str] = &["/opt/homebrew/lib", "/usr/local/lib", "/usr/lib"];

/// Compiled GPU kernel library looked up next to the executable
pub const GPU_RESOURCE_FILE: &str = "default.metallib";

/// Launch flags derived from the acceleration mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareProfile {
    pub gpu_layers: u32,
    pub batch_size: u32,
    pub ctx_size: u32,
}

impl HardwareProfile {
    pub const GPU: HardwareProfile = HardwareProfile {
        gpu_layers: 99,
        batch_size: 512,
        ctx_size: 8192,
    };

    pub const CPU: HardwareProfile = HardwareProfile {
        gpu_layers: 0,
        batch_size: 256,
        ctx_size: 4096,
    };

    pub fn for_acceleration(accelerated: bool) -> Self {
        if accelerated {
            Self::GPU
        } else {
            Self::CPU
        }
    }

    /// Apply user overrides for offloaded layers and context size
    pub fn with_overrides(mut self, gpu_layers: Option<u32>, ctx_size: Option<u32>) -> Self {
        if let Some(layers) = gpu_layers {
            self.gpu_layers = layers;
        }
        if let Some(ctx) = ctx_size {
            self.ctx_size = ctx;
        }
        self
    }

    /// `-ngl N --batch-size N --ctx-size N`
    pub fn args(&self) -> Vec<String> {
        vec![
            "-ngl".to_string(),
            self.gpu_layers.to_string(),
            "--batch-size".to_string(),
            self.batch_size.to_string(),
            "--ctx-size".to_string(),
            self.ctx_size.to_string(),
        ]
    }
}

/// Acceleration facts for one executable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccelerationInfo {
    /// Acceleration library found on disk, if any
    pub library: Option<PathBuf>,
    /// Kernel resource file found near the executable, if any
    pub resources: Option<PathBuf>,
}

impl AccelerationInfo {
    pub fn is_available(&self) -> bool {
        self.library.is_some()
    }

    pub fn profile(&self) -> HardwareProfile {
        HardwareProfile::for_acceleration(self.is_available())
    }

    /// Environment pointing the runtime at its kernel resources
    pub fn env(&self) -> Vec<(String, String)> {
        let Some(resources) = &self.resources else {
            return Vec::new();
        };
        let mut env = Vec::new();
        if let Some(dir) = resources.parent() {
            env.push((
                "GGML_METAL_PATH_RESOURCES".to_string(),
                dir.display().to_string(),
            ));
        }
        env.push(("GGML_METAL_PATH".to_string(), resources.display().to_string()));
        env
    }
}

/// Probe acceleration support for `executable`
pub fn detect_acceleration(executable: &Path) -> AccelerationInfo {
    let info = AccelerationInfo {
        library: find_acceleration_library(&library_dirs(executable)),
        resources: locate_gpu_resources(&resource_dirs(executable)),
    };
    tracing::debug!(
        "Acceleration for {}: library={:?} resources={:?}",
        executable.display(),
        info.library,
        info.resources
    );
    info
}

fn library_dirs(executable: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = LIBRARY_DIRS.iter().map(PathBuf::from).collect();
    if let Some(bin) = executable.parent() {
        dirs.push(bin.to_path_buf());
        if let Some(prefix) = bin.parent() {
            dirs.push(prefix.join("lib"));
        }
    }
    dirs
}

/// First acceleration library present in `dirs`
pub fn find_acceleration_library(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| ACCELERATION_LIBRARIES.iter().map(move |lib| dir.join(lib)))
        .find(|path| path.is_file())
}

/// Directories searched for the kernel resource file, closest first
pub fn resource_dirs(executable: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(bin) = executable.parent() {
        dirs.push(bin.to_path_buf());
        if let Some(prefix) = bin.parent() {
            dirs.push(prefix.join("share").join("llama.cpp"));
        }
    }
    if let Ok(data_dir) = crate::storage::get_data_dir() {
        dirs.push(data_dir.join("runtime").join("share").join("llama.cpp"));
    }
    for prefix in ["/opt/homebrew", "/usr/local"] {
        dirs.push(
            Path::new(prefix)
                .join("opt")
                .join("llama.cpp")
                .join("share")
                .join("llama.cpp"),
        );
    }
    dirs
}

/// First `default.metallib` found in `dirs`
pub fn locate_gpu_resources(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(GPU_RESOURCE_FILE))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_profiles() {
        assert_eq!(
            HardwareProfile::for_acceleration(true).args(),
            vec!["-ngl", "99", "--batch-size", "512", "--ctx-size", "8192"]
        );
        assert_eq!(
            HardwareProfile::for_acceleration(false).args(),
            vec!["-ngl", "0", "--batch-size", "256", "--ctx-size", "4096"]
        );
        let custom = HardwareProfile::GPU.with_overrides(Some(20), None);
        assert_eq!(custom.gpu_layers, 20);
        assert_eq!(custom.ctx_size, 8192);
    }

    #[test]
    fn test_find_acceleration_library() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = vec![dir.path().to_path_buf()];
        assert!(find_acceleration_library(&dirs).is_none());

        fs::write(dir.path().join("libggml-vulkan.so"), b"").unwrap();
        assert_eq!(
            find_acceleration_library(&dirs),
            Some(dir.path().join("libggml-vulkan.so"))
        );
    }

    #[test]
    fn test_locate_gpu_resources_in_share_dir() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        let share = root.path().join("share").join("llama.cpp");
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(&share).unwrap();
        fs::write(share.join(GPU_RESOURCE_FILE), b"kernels").unwrap();

        let exe = bin.join("llama-cli");
        let found = locate_gpu_resources(&resource_dirs(&exe));
        assert_eq!(found, Some(share.join(GPU_RESOURCE_FILE)));

        let info = AccelerationInfo {
            library: None,
            resources: found,
        };
        let env = info.env();
        assert_eq!(env[0].0, "GGML_METAL_PATH_RESOURCES");
        assert_eq!(env[0].1, share.display().to_string());
        assert_eq!(info.profile(), HardwareProfile::CPU);
    }
}
