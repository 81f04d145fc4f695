//! Platform-specific paths for settings and patches.
//!
//! ```rust,no_run
//! use nido_config::paths;
//!
//! let settings = paths::settings_path();
//! let patches = paths::ensure_user_patches_dir().unwrap();
//! for patch in paths::list_user_patches() {
//!     println!("{}", patch.display());
//! }
//! # let _ = (settings, patches);
//! ```

use crate::ConfigError;
use std::path::{Path, PathBuf};

/// Application name used for directory paths.
const APP_NAME: &str = "nido";

/// Subdirectory name for saved patches.
const PATCHES_SUBDIR: &str = "patches";

/// File name of the settings file inside the config directory.
const SETTINGS_FILE: &str = "settings.toml";

/// Extension of patch files.
pub const PATCH_EXTENSION: &str = "json";

/// Returns the user-specific configuration directory.
///
/// # Platform Paths
///
/// - Linux: `~/.config/nido/`
/// - macOS: `~/Library/Application Support/nido/`
/// - Windows: `%APPDATA%\nido\`
///
/// Returns a fallback path if the config directory cannot be determined.
pub fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Returns the path of the user settings file.
pub fn settings_path() -> PathBuf {
    user_config_dir().join(SETTINGS_FILE)
}

/// Returns the user-specific patches directory.
///
/// Patches are user documents, so they live under the data directory
/// (`~/.local/share/nido/patches/` on Linux).
pub fn user_patches_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join(PATCHES_SUBDIR)
}

fn ensure_dir(dir: PathBuf) -> Result<PathBuf, ConfigError> {
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::create_dir(&dir, e))?;
    }
    Ok(dir)
}

/// Ensure the user config directory exists.
pub fn ensure_user_config_dir() -> Result<PathBuf, ConfigError> {
    ensure_dir(user_config_dir())
}

/// Ensure the user patches directory exists.
pub fn ensure_user_patches_dir() -> Result<PathBuf, ConfigError> {
    ensure_dir(user_patches_dir())
}

/// List patch files in the user patches directory.
///
/// Returns an empty vector if the directory doesn't exist or can't be read.
pub fn list_user_patches() -> Vec<PathBuf> {
    list_patches_in_dir(&user_patches_dir())
}

/// Lists patch files in `dir`, sorted by path.
pub fn list_patches_in_dir(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut patches: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == PATCH_EXTENSION)
        })
        .collect();
    patches.sort();
    patches
}

/// Extract the patch name from a path (file name without extension).
pub fn patch_name_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_paths_end_in_app_dirs() {
        assert!(user_config_dir().ends_with(APP_NAME));
        assert!(settings_path().ends_with("nido/settings.toml"));
        assert!(user_patches_dir().ends_with("nido/patches"));
    }

    #[test]
    fn test_list_patches_filters_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub.json")).unwrap();

        let patches = list_patches_in_dir(dir.path());
        let names: Vec<_> = patches
            .iter()
            .filter_map(|p| patch_name_from_path(p))
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        assert!(list_patches_in_dir(Path::new("/definitely/not/here")).is_empty());
    }
}
