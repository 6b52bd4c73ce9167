//! Local credential file handling.
//!
//! Credentials live in a dotenv-style file: `./.env` when one exists in the
//! working directory, otherwise `~/.dsopt.conf`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::ClientError;

pub const API_KEY_VAR: &str = "API_KEY";
pub const API_HOST_VAR: &str = "API_HOST";
const HOME_FILE_NAME: &str = ".dsopt.conf";

/// Where a credential file lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialLocation {
    /// `.env` in the current working directory.
    Dotenv(PathBuf),
    /// `.dsopt.conf` in the user's home directory.
    Home(PathBuf),
}

impl CredentialLocation {
    /// Picks `./.env` if present, else the home file.
    pub fn resolve() -> Result<Self, ClientError> {
        let cwd = std::env::current_dir()?;
        let home = dirs::home_dir()
            .ok_or_else(|| ClientError::Config("cannot determine home directory".into()))?;
        Ok(Self::resolve_in(&cwd, &home))
    }

    pub fn resolve_in(cwd: &Path, home: &Path) -> Self {
        let dotenv = cwd.join(".env");
        if dotenv.exists() {
            Self::Dotenv(dotenv)
        } else {
            Self::Home(home.join(HOME_FILE_NAME))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Dotenv(path) | Self::Home(path) => path,
        }
    }
}

/// Reads `KEY=value` pairs from a credential file without touching the
/// process environment. A missing file yields an empty map.
pub fn read_credentials(path: &Path) -> Result<HashMap<String, String>, ClientError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let iter = dotenvy::from_path_iter(path)
        .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
    let mut values = HashMap::new();
    for item in iter {
        let (key, value) =
            item.map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        values.insert(key, value);
    }
    Ok(values)
}

/// Sets `name=value` in the credential file, replacing any previous line
/// for that name and dropping blank lines.
pub fn upsert_credential(path: &Path, name: &str, value: &str) -> Result<(), ClientError> {
    let existing = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
    };
    let prefix = format!("{name}=");
    let mut lines: Vec<&str> = existing
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with(&prefix))
        .collect();
    let entry = format!("{name}={value}");
    lines.push(&entry);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", lines.join("\n")))?;
    debug!(
        event = "credentials.upserted",
        domain = "config",
        key = name,
        path = %path.display()
    );
    Ok(())
}
