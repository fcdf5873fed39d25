//! TOML configuration file support.
//!
//! Every key is optional; values from the file override the built-in
//! defaults and are themselves overridden by command-line flags.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use lazyxmpp::XmppServerConfig;

/// On-disk configuration, mirroring the server options.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// TCP port for client connections
    pub port: Option<u16>,
    /// Server domain
    pub hostname: Option<String>,
    /// Accept IPv4 connections
    pub enable_ipv4: Option<bool>,
    /// Accept IPv6 connections
    pub enable_ipv6: Option<bool>,
    /// TLS support (must stay false in this version)
    pub enable_tls: Option<bool>,
    /// Advertise in-band registration
    pub enable_registration: Option<bool>,
    /// Offer SASL PLAIN
    pub enable_plain_auth: Option<bool>,
    /// Allow PLAIN on unencrypted streams
    pub enable_unsecure_auth: Option<bool>,
    /// Offer SASL ANONYMOUS
    pub enable_anonymous_auth: Option<bool>,
    /// Path to the user database file
    pub user_db: Option<PathBuf>,
}

impl FileConfig {
    /// Load and parse a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Overlay the file's values onto the given configuration.
    pub fn apply(&self, config: &mut XmppServerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ref hostname) = self.hostname {
            config.hostname = hostname.clone();
        }
        if let Some(enable_ipv4) = self.enable_ipv4 {
            config.enable_ipv4 = enable_ipv4;
        }
        if let Some(enable_ipv6) = self.enable_ipv6 {
            config.enable_ipv6 = enable_ipv6;
        }
        if let Some(enable_tls) = self.enable_tls {
            config.enable_tls = enable_tls;
        }
        if let Some(enable_registration) = self.enable_registration {
            config.enable_registration = enable_registration;
        }
        if let Some(enable_plain_auth) = self.enable_plain_auth {
            config.enable_plain_auth = enable_plain_auth;
        }
        if let Some(enable_unsecure_auth) = self.enable_unsecure_auth {
            config.enable_unsecure_auth = enable_unsecure_auth;
        }
        if let Some(enable_anonymous_auth) = self.enable_anonymous_auth {
            config.enable_anonymous_auth = enable_anonymous_auth;
        }
    }
}
