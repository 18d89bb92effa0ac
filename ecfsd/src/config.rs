//! Daemon configuration.
//!
//! Settings come from an optional YAML file, then the environment, then the
//! command line, each layer overriding the previous one.
//!
//! Environment variables:
//! - `ECFS_MANAGEMENT_URL`: base URL of the management server.
//! - `ECFS_USERNAME` / `ECFS_PASSWORD`: management credentials.
//! - `ECFS_NFS_SERVER`: address NFS exports are mounted from.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use clap::ValueEnum;
use libecfs::backend::RestConfig;
use libecfs::params::DEFAULT_CAPACITY_BYTES;
use serde::Deserialize;

pub const ENV_MANAGEMENT_URL: &str = "ECFS_MANAGEMENT_URL";
pub const ENV_USERNAME: &str = "ECFS_USERNAME";
pub const ENV_PASSWORD: &str = "ECFS_PASSWORD";
pub const ENV_NFS_SERVER: &str = "ECFS_NFS_SERVER";

const DEFAULT_ENDPOINT: &str = "0.0.0.0:7443";
const DEFAULT_TLS_CERT: &str = "/etc/ecfs/tls.crt";
const DEFAULT_TLS_KEY: &str = "/etc/ecfs/tls.key";

/// Which CSI services this process serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Node,
    #[default]
    All,
}

impl Role {
    pub fn controller(self) -> bool {
        matches!(self, Self::Controller | Self::All)
    }

    pub fn node(self) -> bool {
        matches!(self, Self::Node | Self::All)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The management REST API.
    #[default]
    Rest,
    /// In-process state, lost on exit.
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub url: String,
    pub username: String,
    pub password: String,
    pub accept_invalid_certs: bool,
}

impl BackendConfig {
    pub fn rest(&self) -> RestConfig {
        RestConfig {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: PathBuf::from(DEFAULT_TLS_CERT),
            key: PathBuf::from(DEFAULT_TLS_KEY),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoint: SocketAddr,
    pub role: Role,
    /// Defaults to the host name.
    pub node_id: Option<String>,
    pub tls: TlsConfig,
    pub backend: BackendConfig,
    pub nfs_server: String,
    pub default_capacity_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 7443))),
            role: Role::default(),
            node_id: None,
            tls: TlsConfig::default(),
            backend: BackendConfig::default(),
            nfs_server: String::new(),
            default_capacity_bytes: DEFAULT_CAPACITY_BYTES,
        }
    }
}

impl Config {
    /// Read `path`, or start from defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply the `ECFS_*` overrides found by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(url) = non_empty(ENV_MANAGEMENT_URL) {
            self.backend.url = url;
        }
        if let Some(username) = non_empty(ENV_USERNAME) {
            self.backend.username = username;
        }
        if let Some(password) = non_empty(ENV_PASSWORD) {
            self.backend.password = password;
        }
        if let Some(server) = non_empty(ENV_NFS_SERVER) {
            self.nfs_server = server;
        }
    }

    /// Check that the enabled roles have what they need.
    pub fn validate(&self) -> Result<()> {
        if self.role.controller() && self.backend.kind == BackendKind::Rest {
            ensure!(
                !self.backend.url.is_empty(),
                "backend.url (or {ENV_MANAGEMENT_URL}) is required for the controller role"
            );
            ensure!(
                !self.backend.username.is_empty(),
                "backend.username (or {ENV_USERNAME}) is required for the controller role"
            );
        }
        if self.role.controller() && self.nfs_server.is_empty() {
            bail!("nfs_server (or {ENV_NFS_SERVER}) is required for the controller role");
        }
        ensure!(
            self.default_capacity_bytes > 0,
            "default_capacity_bytes must be positive"
        );
        Ok(())
    }

    /// Configured node id, else the host name.
    pub fn node_id(&self) -> Result<String> {
        if let Some(id) = self.node_id.as_ref().filter(|id| !id.is_empty()) {
            return Ok(id.clone());
        }
        let host = nix::unistd::gethostname().context("Failed to read host name")?;
        host.into_string()
            .map_err(|raw| anyhow::anyhow!("host name {raw:?} is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
endpoint: 127.0.0.1:9000
role: controller
tls:
  cert: /run/ecfs/cert.pem
backend:
  url: https://emanage.local
  username: admin
  password: changeme
nfs_server: 10.0.0.5
"#;

    #[test]
    fn yaml_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecfsd.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.endpoint, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.role, Role::Controller);
        assert_eq!(config.tls.cert, PathBuf::from("/run/ecfs/cert.pem"));
        assert_eq!(config.tls.key, PathBuf::from(DEFAULT_TLS_KEY));
        assert_eq!(config.backend.kind, BackendKind::Rest);
        assert_eq!(config.default_capacity_bytes, DEFAULT_CAPACITY_BYTES);
        config.validate().unwrap();
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/ecfsd.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn environment_overrides_file() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_MANAGEMENT_URL, "https://other"),
            (ENV_PASSWORD, "s3cret"),
            (ENV_NFS_SERVER, ""),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.backend.url, "https://other");
        assert_eq!(config.backend.username, "admin");
        assert_eq!(config.backend.password, "s3cret");
        assert_eq!(config.nfs_server, "10.0.0.5");
    }

    #[test]
    fn roles_need_their_settings() {
        let node = Config {
            role: Role::Node,
            ..Default::default()
        };
        node.validate().unwrap();

        assert!(Config::default().validate().is_err());

        let memory: Config =
            serde_yaml::from_str("backend: {kind: memory}\nnfs_server: 10.0.0.5\n").unwrap();
        memory.validate().unwrap();
    }

    #[test]
    fn explicit_node_id_wins() {
        let config = Config {
            node_id: Some("worker-3".into()),
            ..Default::default()
        };
        assert_eq!(config.node_id().unwrap(), "worker-3");
    }

    #[test]
    fn role_selection() {
        assert!(Role::All.controller() && Role::All.node());
        assert!(!Role::Node.controller());
        assert!(!Role::Controller.node());
    }
}
