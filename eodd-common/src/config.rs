//! Configuration loading, root folder resolution and config signatures

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "EODD_ROOT_FOLDER";

/// Environment variable overriding the configuration file location
pub const CONFIG_PATH_ENV: &str = "EODD_CONFIG";

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. `root_folder` from the TOML config
/// 4. OS-dependent compiled default
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_value: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = toml_value {
        return path.to_path_buf();
    }

    default_root_folder()
}

/// Locate the configuration file
///
/// Explicit path, then `EODD_CONFIG`, then the per-user config directory,
/// then `/etc/eodd/config.toml` on Linux.
pub fn locate_config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(Error::Config(format!("Config file not found: {}", path.display())))
        };
    }

    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        warn!("{} points at a missing file: {}", CONFIG_PATH_ENV, path.display());
    }

    let user_config = dirs::config_dir().map(|d| d.join("eodd").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Ok(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/eodd/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
    }

    Err(Error::Config("No config file found".to_string()))
}

/// Read and deserialize a TOML document
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    let parsed = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;
    debug!("Loaded configuration from {}", path.display());
    Ok(parsed)
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("eodd"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/eodd"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("eodd"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/eodd"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("eodd"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\eodd"))
    } else {
        PathBuf::from("./eodd_data")
    }
}

// ============================================================================
// Config signatures
// ============================================================================

/// Signature file guarding a configuration document against silent edits
///
/// The signature is the SHA-256 of the file contents, stored next to the file
/// with a `.sig` extension. Re-sign after an intentional change.
#[derive(Debug, Clone)]
pub struct ConfigSignature {
    config_path: PathBuf,
}

impl ConfigSignature {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Path of the `.sig` file
    pub fn signature_path(&self) -> PathBuf {
        self.config_path.with_extension("sig")
    }

    /// Hash the current config file contents
    pub fn digest(&self) -> Result<String> {
        let contents = std::fs::read(&self.config_path)?;
        Ok(format!("{:x}", Sha256::digest(&contents)))
    }

    /// Write the signature file for the current contents
    pub fn sign(&self) -> Result<String> {
        let digest = self.digest()?;
        std::fs::write(self.signature_path(), format!("{}\n", digest))?;
        info!(
            config = %self.config_path.display(),
            signature = %self.signature_path().display(),
            "Wrote config signature"
        );
        Ok(digest)
    }

    /// Check the config file still matches its signature
    pub fn verify(&self) -> Result<()> {
        let sig_path = self.signature_path();
        if !sig_path.exists() {
            return Err(Error::Config(format!(
                "Signature file not found: {} (run sign-config first)",
                sig_path.display()
            )));
        }

        let expected = std::fs::read_to_string(&sig_path)?;
        let actual = self.digest()?;
        if expected.trim() == actual {
            debug!("Config signature matches");
            Ok(())
        } else {
            Err(Error::Config(format!(
                "Config {} does not match its signature; re-sign after intentional changes",
                self.config_path.display()
            )))
        }
    }
}
