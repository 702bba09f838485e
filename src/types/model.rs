//! Model types
//!
//! Describes a model file found in the models directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A GGUF model file available locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledModel {
    /// Display name derived from the file stem
    pub name: String,
    /// File name, the identity key
    pub file_name: String,
    /// Absolute path to the file
    pub path: PathBuf,
}

impl InstalledModel {
    /// Build from a path, deriving name and file name
    pub fn from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?.to_string();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&file_name);
        Some(Self {
            name: display_name(stem),
            file_name,
            path: path.to_path_buf(),
        })
    }
}

/// "llama-2-7b.Q4_K_M" -> "llama 2 7b Q4_K_M"
fn display_name(stem: &str) -> String {
    stem.replace(['-', '.'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path() {
        let model = InstalledModel::from_path(Path::new("/models/llama-2-7b.Q4_K_M.gguf")).unwrap();
        assert_eq!(model.file_name, "llama-2-7b.Q4_K_M.gguf");
        assert_eq!(model.name, "llama 2 7b Q4_K_M");
        assert_eq!(model.path, PathBuf::from("/models/llama-2-7b.Q4_K_M.gguf"));
    }
}
