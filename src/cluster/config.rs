//! Cluster Configuration
//!
//! Loads the list of hypervisor clusters and resolves their credentials.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Configuration
// =============================================================================

/// Top-level cluster configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClustersConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

/// Connection settings for one cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// API base URL, e.g. `https://pve-1:8006/api2/json`
    pub url: String,
    /// Region (cluster alias) the cluster is addressed by
    pub region: String,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default)]
    pub token_id_file: Option<PathBuf>,
    #[serde(default)]
    pub token_secret_file: Option<PathBuf>,
}

/// Resolved credentials
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Privileged user login
    Password { username: String, password: String },
    /// API token
    Token { id: String, secret: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password { username, .. } => {
                write!(f, "Password {{ username: {:?} }}", username)
            }
            Credentials::Token { id, .. } => write!(f, "Token {{ id: {:?} }}", id),
        }
    }
}

impl ClustersConfig {
    /// Load the configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn get(&self, region: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.region == region)
    }
}

impl ClusterConfig {
    /// Resolve credentials. A username and password take precedence over
    /// an API token; token parts may be read from files.
    pub fn credentials(&self) -> Result<Credentials> {
        if let (Some(username), Some(password)) =
            (non_empty(&self.username), non_empty(&self.password))
        {
            return Ok(Credentials::Password {
                username: username.to_string(),
                password: password.to_string(),
            });
        }

        let id = match &self.token_id_file {
            Some(path) => read_secret(path)?,
            None => non_empty(&self.token_id).map(str::to_string).unwrap_or_default(),
        };
        let secret = match &self.token_secret_file {
            Some(path) => read_secret(path)?,
            None => non_empty(&self.token_secret)
                .map(str::to_string)
                .unwrap_or_default(),
        };

        if id.is_empty() || secret.is_empty() {
            return Err(Error::Configuration(format!(
                "cluster {} has no usable credentials",
                self.region
            )));
        }

        Ok(Credentials::Token { id, secret })
    }

    /// Whether the cluster is configured with a privileged user login
    pub fn is_privileged(&self) -> bool {
        matches!(self.credentials(), Ok(Credentials::Password { .. }))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn read_secret(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("failed to read {}: {}", path.display(), e))
    })?;

    let value = raw.trim();
    if value.is_empty() {
        return Err(Error::Configuration(format!("{} is empty", path.display())));
    }

    Ok(value.to_string())
}
