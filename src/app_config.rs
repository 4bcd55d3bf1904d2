//! Locating the configuration file.
//!
//! An explicit `--config-path` always wins. Otherwise the first existing file among the search
//! paths is used, and without one the built-in defaults apply.

use std::path::{Path, PathBuf};

use tracing::debug;
use zip_reaper::config::{Config, ConfigError};

/// Returns config file paths in descending priority order.
/// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(not(target_os = "macos"))]
    if let Some(xdg) = dirs::config_dir() {
        paths.push(xdg.join("zip-reaper").join("config.toml"));
    }

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config").join("zip-reaper").join("config.toml"));
    }

    paths.push(PathBuf::from("/etc/zip-reaper/config.toml"));

    paths
}

/// Finds the first existing config file from search paths.
fn find_config_file() -> Option<PathBuf> {
    config_search_paths().into_iter().find(|p| p.exists())
}

/// Load and validate the configuration.
///
/// Errors if the chosen file is unreadable, malformed or invalid; a missing file is only an
/// error when it was named explicitly.
pub fn load(external_config_path: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = external_config_path {
        return Config::load_from_file(path);
    }

    match find_config_file() {
        Some(path) => Config::load_from_file(&path),
        None => {
            debug!("No configuration file found; using defaults.");
            Ok(Config::default())
        }
    }
}

/// Render `config` as TOML, e.g. to seed a configuration file.
pub fn render(config: &Config) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_paths_end_with_system_path() {
        let paths = config_search_paths();
        assert_eq!(
            paths.last(),
            Some(&PathBuf::from("/etc/zip-reaper/config.toml"))
        );
    }

    #[test]
    fn rendered_defaults_load_back() {
        let rendered = render(&Config::default()).unwrap();
        assert!(rendered.contains("quick-pend-min-ms = 100"), "{rendered}");
        assert_eq!(Config::from_toml_str(&rendered).unwrap(), Config::default());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = load(Some(Path::new("/nonexistent/zip-reaper.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
