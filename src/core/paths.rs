use crate::error::{Error, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Base deploybot config directory (~/.config/deploybot/ on all platforms)
pub fn deploybot() -> Result<PathBuf> {
    #[cfg(windows)]
    {
        let appdata = env::var("APPDATA").map_err(|_| {
            Error::internal_unexpected(
                "APPDATA environment variable not set on Windows".to_string(),
            )
        })?;
        Ok(PathBuf::from(appdata).join("deploybot"))
    }

    #[cfg(not(windows))]
    {
        let home = env::var("HOME").map_err(|_| {
            Error::internal_unexpected(
                "HOME environment variable not set on Unix-like system".to_string(),
            )
        })?;
        Ok(PathBuf::from(home).join(".config").join("deploybot"))
    }
}

/// Global deploybot.json config file path
pub fn deploybot_json() -> Result<PathBuf> {
    Ok(deploybot()?.join("deploybot.json"))
}

/// Default location of the record database
pub fn default_database() -> Result<PathBuf> {
    Ok(deploybot()?.join("deploybot.db"))
}

/// Checkout directory for one (repository, branch) pair.
pub fn checkout_dir(base: &Path, repository_id: &str, branch: &str) -> PathBuf {
    base.join(repository_id).join(branch)
}
