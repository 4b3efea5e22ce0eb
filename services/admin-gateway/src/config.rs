//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The API base URL comes from `ADMIN_API_URL` (server-side address, wins),
//! then `ADMIN_PUBLIC_API_URL`, then `[api] base_url`, then the local
//! default.

use platform_auth::DEFAULT_API_BASE_URL;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Root configuration. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Local listener settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Platform API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Session settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// Persist the session here; in-memory only when unset
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_path: None,
            refresh_timeout_secs: default_refresh_timeout(),
            max_pending: default_max_pending(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_max_connections() -> usize {
    1000
}

fn default_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_refresh_timeout() -> u64 {
    30
}

fn default_max_pending() -> usize {
    1024
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Defaults plus environment, for running without a config file.
    pub fn from_env() -> Result<Self> {
        Config::default().finish()
    }

    fn finish(mut self) -> Result<Self> {
        if let Some(url) = env_base_url() {
            self.api.base_url = url;
        }
        self.api.base_url = self.api.base_url.trim_end_matches('/').to_string();
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }
        if self.api.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be greater than 0".into()));
        }
        if self.auth.refresh_timeout_secs == 0 {
            return Err(Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.auth.max_pending == 0 {
            return Err(Error::Config("max_pending must be greater than 0".into()));
        }
        if self.gateway.max_connections == 0 {
            return Err(Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("admin-gateway.toml")
    }
}

/// Server-side URL first, then the public one. Blank values are ignored.
fn env_base_url() -> Option<String> {
    ["ADMIN_API_URL", "ADMIN_PUBLIC_API_URL"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_api_env() {
        unsafe {
            remove_env("ADMIN_API_URL");
            remove_env("ADMIN_PUBLIC_API_URL");
        }
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin-gateway.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_api_env();
        let (_dir, path) = write_config(
            r#"
[gateway]
listen_addr = "127.0.0.1:4000"
max_connections = 50

[api]
base_url = "https://platform.example.com/"
timeout_secs = 10

[auth]
credentials_path = "/var/lib/admin-gateway/session.json"
refresh_timeout_secs = 5
max_pending = 16
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway.listen_addr.port(), 4000);
        assert_eq!(config.gateway.max_connections, 50);
        assert_eq!(config.api.base_url, "https://platform.example.com");
        assert_eq!(config.api.timeout_secs, 10);
        assert_eq!(
            config.auth.credentials_path,
            Some(PathBuf::from("/var/lib/admin-gateway/session.json"))
        );
        assert_eq!(config.auth.refresh_timeout_secs, 5);
        assert_eq!(config.auth.max_pending, 16);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_api_env();
        let (_dir, path) = write_config("");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.api.base_url, "http://localhost:8000");
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.auth.refresh_timeout_secs, 30);
        assert_eq!(config.auth.max_pending, 1024);
        assert_eq!(config.gateway.max_connections, 1000);
        assert!(config.auth.credentials_path.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let (_dir, path) = write_config("not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(Error::Toml(_))));
    }

    #[test]
    fn test_server_url_env_wins() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (_dir, path) = write_config("[api]\nbase_url = \"http://from-file:8000\"\n");

        unsafe {
            set_env("ADMIN_API_URL", "http://api.internal:8000");
            set_env("ADMIN_PUBLIC_API_URL", "https://api.example.com");
        }
        let config = Config::load(&path).unwrap();
        clear_api_env();

        assert_eq!(config.api.base_url, "http://api.internal:8000");
    }

    #[test]
    fn test_public_url_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_api_env();
        let (_dir, path) = write_config("[api]\nbase_url = \"http://from-file:8000\"\n");

        unsafe { set_env("ADMIN_PUBLIC_API_URL", "https://api.example.com/") };
        let config = Config::load(&path).unwrap();
        clear_api_env();

        assert_eq!(config.api.base_url, "https://api.example.com");
    }

    #[test]
    fn test_blank_env_is_ignored() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_api_env();
        unsafe { set_env("ADMIN_API_URL", "  ") };
        let config = Config::from_env().unwrap();
        clear_api_env();

        assert_eq!(config.api.base_url, "http://localhost:8000");
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_api_env();
        let (_dir, path) = write_config("[api]\nbase_url = \"platform.example.com\"\n");

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(
            err.contains("base_url must start with http"),
            "error message should explain the issue, got: {err}"
        );
    }

    #[test]
    fn test_zero_limits_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_api_env();
        for contents in [
            "[api]\ntimeout_secs = 0\n",
            "[auth]\nrefresh_timeout_secs = 0\n",
            "[auth]\nmax_pending = 0\n",
            "[gateway]\nmax_connections = 0\n",
        ] {
            let (_dir, path) = write_config(contents);
            assert!(
                matches!(Config::load(&path), Err(Error::Config(_))),
                "must be rejected: {contents}"
            );
        }
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("admin-gateway.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
