//! Daemon configuration — CLI/env over TOML over built-in default
//! (spec.md §6.2), following the teacher's `DaemonConfig` loader shape.

use serde::Deserialize;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:4488";
const DEFAULT_RPC_PATH: &str = "/api/rpc/stream";
const DEFAULT_LOG_LEVEL: &str = "info";

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost".to_string(), "http://127.0.0.1".to_string()]
}

/// `{data_dir}/config.toml` — every field is an optional override.
/// Priority: CLI / env  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    bind_address: Option<String>,
    allowed_origins: Option<Vec<String>>,
    auth_token: Option<String>,
    require_token: Option<bool>,
    public_metrics: Option<bool>,
    basic_auth_enabled: Option<bool>,
    basic_auth_username: Option<String>,
    basic_auth_password: Option<String>,
    project_root: Option<String>,
    external_url: Option<String>,
    enable_browser: Option<bool>,
    rpc_path: Option<String>,
    log_level: Option<String>,
    log_file: Option<String>,
    static_dir: Option<String>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// CLI/env overrides, as populated by `clap` in `main.rs`. Every field is
/// `Option` so "not passed" is distinguishable from "passed as a falsy
/// value".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
    pub auth_token: Option<String>,
    pub require_token: Option<bool>,
    pub public_metrics: Option<bool>,
    pub basic_auth_enabled: Option<bool>,
    pub basic_auth_username: Option<String>,
    pub basic_auth_password: Option<String>,
    pub project_root: Option<PathBuf>,
    pub external_url: Option<String>,
    pub enable_browser: Option<bool>,
    pub rpc_path: Option<String>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub static_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub bind_address: String,
    pub allowed_origins: Vec<String>,
    pub auth_token: Option<String>,
    pub require_token: bool,
    pub public_metrics: bool,
    pub basic_auth_enabled: bool,
    pub basic_auth_username: Option<String>,
    pub basic_auth_password: Option<String>,
    pub project_root: PathBuf,
    pub external_url: Option<String>,
    pub enable_browser: bool,
    pub rpc_path: String,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub static_dir: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn new(overrides: ConfigOverrides) -> anyhow::Result<Self> {
        let data_dir = overrides.data_dir.clone().unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let cfg = Self {
            bind_address: overrides
                .bind_address
                .or(toml.bind_address)
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            allowed_origins: overrides
                .allowed_origins
                .or(toml.allowed_origins)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_allowed_origins),
            auth_token: overrides.auth_token.or(toml.auth_token).filter(|t| !t.is_empty()),
            require_token: overrides.require_token.or(toml.require_token).unwrap_or(false),
            public_metrics: overrides.public_metrics.or(toml.public_metrics).unwrap_or(false),
            basic_auth_enabled: overrides
                .basic_auth_enabled
                .or(toml.basic_auth_enabled)
                .unwrap_or(false),
            basic_auth_username: overrides.basic_auth_username.or(toml.basic_auth_username),
            basic_auth_password: overrides.basic_auth_password.or(toml.basic_auth_password),
            project_root: overrides
                .project_root
                .or_else(|| toml.project_root.map(PathBuf::from))
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
                ,
            external_url: overrides.external_url.or(toml.external_url),
            enable_browser: overrides.enable_browser.or(toml.enable_browser).unwrap_or(true),
            rpc_path: overrides
                .rpc_path
                .or(toml.rpc_path)
                .unwrap_or_else(|| DEFAULT_RPC_PATH.to_string()),
            log_level: overrides.log_level.or(toml.log_level).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            log_file: overrides.log_file.or_else(|| toml.log_file.map(PathBuf::from)),
            static_dir: overrides.static_dir.or_else(|| toml.static_dir.map(PathBuf::from)),
            data_dir,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// spec.md §4.1's fail-fast startup checks.
    fn validate(&self) -> anyhow::Result<()> {
        if self.basic_auth_enabled {
            let user = self.basic_auth_username.as_deref().unwrap_or("");
            let pass = self.basic_auth_password.as_deref().unwrap_or("");
            if user.is_empty() || pass.is_empty() {
                anyhow::bail!("basicAuthEnabled requires both a non-empty username and password");
            }
        }
        if !self.is_loopback_bind() && !self.require_token && !self.basic_auth_enabled {
            anyhow::bail!(
                "bind address {} is not loopback — enable requireToken or basic auth to avoid an unauthenticated control plane",
                self.bind_address
            );
        }
        Ok(())
    }

    /// spec.md §4.1's loopback test: `localhost`, `127.0.0.0/8`, `::1` are
    /// loopback; `0.0.0.0` and `::` are explicitly NOT.
    pub fn is_loopback_bind(&self) -> bool {
        let host = self
            .bind_address
            .rsplit_once(':')
            .map(|(h, _)| h.trim_start_matches('[').trim_end_matches(']'))
            .unwrap_or(&self.bind_address);
        if host == "0.0.0.0" || host == "::" {
            return false;
        }
        if host == "localhost" || host == "::1" {
            return true;
        }
        if let Ok(addr) = host.parse::<std::net::IpAddr>() {
            return addr.is_loopback();
        }
        // Fall back to resolution for hostnames other than "localhost".
        (host, 0u16)
            .to_socket_addrs()
            .map(|mut addrs| addrs.all(|a| a.ip().is_loopback()))
            .unwrap_or(false)
    }
}

impl Default for DaemonConfig {
    /// Loopback bind, no auth, a throwaway data dir — used by handler unit
    /// tests that construct an [`AppContext`](crate::AppContext) directly
    /// rather than through `main`'s CLI/env/TOML loader.
    fn default() -> Self {
        let overrides = ConfigOverrides { data_dir: Some(std::env::temp_dir().join("buckley-test-default")), ..Default::default() };
        Self::new(overrides).expect("default config overrides must pass validate()")
    }
}

fn default_data_dir() -> PathBuf {
    dirs_data_dir().join("buckley")
}

fn dirs_data_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides() -> ConfigOverrides {
        ConfigOverrides {
            bind_address: Some("127.0.0.1:4488".to_string()),
            data_dir: Some(PathBuf::from("/tmp/buckley-test")),
            ..Default::default()
        }
    }

    #[test]
    fn loopback_bind_needs_no_auth() {
        let cfg = DaemonConfig::new(overrides()).unwrap();
        assert!(cfg.is_loopback_bind());
    }

    #[test]
    fn non_loopback_bind_without_auth_fails_startup() {
        let mut o = overrides();
        o.bind_address = Some("0.0.0.0:4488".to_string());
        assert!(DaemonConfig::new(o).is_err());
    }

    #[test]
    fn non_loopback_bind_with_require_token_is_ok() {
        let mut o = overrides();
        o.bind_address = Some("0.0.0.0:4488".to_string());
        o.require_token = Some(true);
        assert!(DaemonConfig::new(o).is_ok());
    }

    #[test]
    fn basic_auth_needs_both_fields() {
        let mut o = overrides();
        o.basic_auth_enabled = Some(true);
        o.basic_auth_username = Some("admin".to_string());
        assert!(DaemonConfig::new(o).is_err());
    }

    #[test]
    fn wildcard_v6_is_not_loopback() {
        let mut o = overrides();
        o.bind_address = Some("[::]:4488".to_string());
        o.require_token = Some(true);
        let cfg = DaemonConfig::new(o).unwrap();
        assert!(!cfg.is_loopback_bind());
    }
}
