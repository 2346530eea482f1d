//! CLI configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/chunkup/cli.toml`
//! - Windows: `%APPDATA%/chunkup/cli.toml`

use std::path::{Path, PathBuf};

use chunkup_protocol::constants::DEFAULT_BASE_URL;
use chunkup_uploader::UploaderSettings;
use serde::{Deserialize, Serialize};

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// API root of the upload server.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Bearer token sent with every request. Empty means anonymous.
    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub uploader: UploaderSettings,
}

fn default_server_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token: String::new(),
            uploader: UploaderSettings::default(),
        }
    }
}

impl CliConfig {
    /// Loads configuration from `path` (or the platform default), creating
    /// a default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: CliConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = CliConfig::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Writes the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix (may contain a token).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Token to attach, if any.
    pub fn token(&self) -> Option<String> {
        Some(self.token.clone()).filter(|t| !t.is_empty())
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("chunkup")
            .join("cli.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("chunkup").join("cli.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/chunkup/cli.toml"))
    }
}
