//! Configuration for the two server roles.
//!
//! Both servers read an optional TOML file; command-line flags override
//! file values, file values override the defaults below. Everything
//! deployment-specific that §6 calls out as environment-sensitive (the
//! advertised address, the EXEC trust hole, heartbeat timing) lives here
//! rather than in code.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Naming server configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NsConfig {
    /// TCP port the naming server listens on.
    pub port: u16,
    /// Allow the EXEC operation. EXEC runs user-supplied file contents
    /// under the local shell on the naming host and is therefore off
    /// unless a deployment explicitly opts in.
    pub enable_exec: bool,
    /// Seconds between heartbeat probes.
    pub heartbeat_interval_secs: u64,
    /// Seconds without contact before a storage server is marked failed.
    pub heartbeat_timeout_secs: u64,
}

impl Default for NsConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            enable_exec: false,
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 15,
        }
    }
}

/// Storage server configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SsConfig {
    /// Address advertised to clients for data-plane connections.
    ///
    /// When unset the server derives one by connecting a UDP socket to a
    /// public address and reading the local socket name, which is good
    /// enough on a LAN but wrong behind NAT or in a container.
    pub advertise_ip: Option<String>,
    /// Root directory for live file trees, one subdirectory per SS id.
    pub storage_root: PathBuf,
    /// Root directory for undo backups, one subdirectory per SS id.
    pub backup_root: PathBuf,
}

impl Default for SsConfig {
    fn default() -> Self {
        Self {
            advertise_ip: None,
            storage_root: PathBuf::from("storage"),
            backup_root: PathBuf::from("backup"),
        }
    }
}

/// Loads a TOML config file, or the default when `path` is `None`.
pub fn load<T>(path: Option<&Path>) -> anyhow::Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match path {
        None => Ok(T::default()),
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))
        }
    }
}
