//! Managed runtime copies
//!
//! Copies a discovered llama.cpp binary (and its GPU kernel resources) into the
//! application data directory, where the resolver looks right after explicit
//! overrides.

use std::fs;
use std::path::{Path, PathBuf};

use crate::inference::EngineError;
use crate::system::gpu::{locate_gpu_resources, resource_dirs, GPU_RESOURCE_FILE};

/// Installs executables under `<root>/runtime`
#[derive(Debug, Clone)]
pub struct RuntimeProvisioner {
    root: PathBuf,
}

impl RuntimeProvisioner {
    /// `root` is the application data directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("runtime").join("bin")
    }

    pub fn share_dir(&self) -> PathBuf {
        self.root.join("runtime").join("share").join("llama.cpp")
    }

    /// Copy `source` into the managed bin directory and mark it executable.
    /// Returns the installed path.
    pub fn install(&self, source: &Path) -> Result<PathBuf, EngineError> {
        let name = source.file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a file path: {}", source.display()),
            )
        })?;
        let bin_dir = self.bin_dir();
        fs::create_dir_all(&bin_dir)?;

        let dest = bin_dir.join(name);
        let tmp = bin_dir.join(format!("{}.tmp", name.to_string_lossy()));
        fs::copy(source, &tmp)?;
        set_executable(&tmp)?;
        fs::rename(&tmp, &dest)?;
        tracing::info!("Installed {} -> {}", source.display(), dest.display());

        if let Some(resources) = locate_gpu_resources(&resource_dirs(source)) {
            let share = self.share_dir();
            fs::create_dir_all(&share)?;
            let target = share.join(GPU_RESOURCE_FILE);
            if resources != target {
                fs::copy(&resources, &target)?;
                tracing::info!("Copied GPU resources {}", resources.display());
            }
        }

        Ok(dest)
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), EngineError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), EngineError> {
    Ok(())
}
