//! Configuration: TOML file + environment overrides.
//!
//! Every section is `#[serde(default)]` so a partial (or missing) config file
//! still produces a working gateway. Environment variables override the file
//! for the values operators most often inject at deploy time.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which client library the WhatsApp channel wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientBackend {
    /// Native socket-protocol client (`whatsapp-rust`).
    #[default]
    Socket,
    /// Browser-automation client behind the bundled Node.js bridge.
    Bridge,
}

impl std::fmt::Display for ClientBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientBackend::Socket => write!(f, "socket"),
            ClientBackend::Bridge => write!(f, "bridge"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub whatsapp: WhatsAppConfig,
    pub forward: ForwardConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// API key required by `/send` and `/reset-auth`. When unset, the
    /// protected endpoints reject every request.
    pub api_key: Option<String>,
    /// Explicit opt-in before the gateway will bind a public interface.
    pub allow_public_bind: bool,
    /// Per-minute rate limit for `/send` (0 disables limiting).
    pub send_per_minute: u32,
    /// Per-minute rate limit for `/reset-auth` (0 disables limiting).
    pub reset_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3001,
            api_key: None,
            allow_public_bind: false,
            send_per_minute: 30,
            reset_per_minute: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// Which wrapped client library to use.
    pub backend: ClientBackend,
    /// Root directory for session credentials and the bridge install.
    pub data_dir: String,
    /// Device name shown under Linked Devices on the phone.
    pub device_name: String,
    /// Senders whose messages are forwarded. `"*"` allows everyone; an
    /// empty list denies everyone.
    pub allowed_numbers: Vec<String>,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            backend: ClientBackend::default(),
            data_dir: "~/.wagate".into(),
            device_name: "WAGATE".into(),
            allowed_numbers: vec!["*".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ForwardConfig {
    /// Base URL of the backend application. Inbound messages are POSTed to
    /// `{backend_url}/whatsapp/incoming`. When unset, inbound messages are
    /// dropped (with a debug log).
    pub backend_url: Option<String>,
}

impl Config {
    /// Load from `path` (or the default location), then apply environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("invalid config at {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Default config location: `~/.wagate/config.toml`.
    pub fn default_config_path() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".wagate").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from(".wagate/config.toml"))
    }

    /// Apply environment overrides through a lookup closure (injectable for
    /// tests).
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(key) = get("WAGATE_API_KEY").filter(|v| !v.is_empty()) {
            self.gateway.api_key = Some(key);
        }
        if let Some(url) = get("WAGATE_BACKEND_URL").filter(|v| !v.is_empty()) {
            self.forward.backend_url = Some(url);
        }
        if let Some(dir) = get("WAGATE_DATA_DIR").filter(|v| !v.is_empty()) {
            self.whatsapp.data_dir = dir;
        }
    }

    /// Shell-expanded data directory.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.whatsapp.data_dir).into_owned())
    }

    /// Where the socket backend's session credentials live. The wrapped
    /// library owns the contents; we only pick the path.
    pub fn session_dir(&self) -> PathBuf {
        self.data_dir().join("session")
    }

    /// Where the bridge backend's auth state lives.
    pub fn bridge_auth_dir(&self) -> PathBuf {
        self.data_dir().join("bridge-auth")
    }

    /// Where the Node.js bridge is installed.
    pub fn bridge_dir(&self) -> PathBuf {
        self.data_dir().join("bridge")
    }
}
