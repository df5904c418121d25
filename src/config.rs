//! Configuration management

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/draupnir/config.yaml";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "DRAUPNIR_";

/// Environment name that swaps in the integration-test identity provider
pub const TEST_ENVIRONMENT: &str = "test";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Deployment environment (`production`, `test`, ...)
    pub environment: String,
    /// Bearer secret of the privileged upload identity
    pub shared_secret: String,
    /// Only users with emails in this domain may authenticate
    pub trusted_user_email_domain: String,
    /// Hostname clients use to reach instances
    pub public_hostname: String,
    /// Root directory handed to the privileged scripts
    pub data_path: PathBuf,
    /// Lowest instance port (inclusive)
    pub min_instance_port: u16,
    /// Highest instance port (exclusive)
    pub max_instance_port: u16,
    /// Period of the instance cleaner sweep
    #[serde(with = "humantime_serde")]
    pub clean_interval: Duration,
    /// HTTP listener
    pub http: HttpConfig,
    /// OAuth client
    pub oauth: OAuthConfig,
    /// Firewall whitelisting
    pub whitelist: WhitelistConfig,
    /// Proxies whose `X-Forwarded-For` entries are skipped
    pub trusted_proxy_cidrs: Vec<String>,
    /// Take the client address from `X-Forwarded-For`
    pub use_x_forwarded_for: bool,
    /// Collector that receives reported errors
    pub error_webhook_url: Option<String>,
    /// File the store snapshots its records to; records are lost on restart
    /// when unset
    pub state_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            environment: "production".to_string(),
            shared_secret: String::new(),
            trusted_user_email_domain: String::new(),
            public_hostname: String::new(),
            data_path: PathBuf::new(),
            min_instance_port: 0,
            max_instance_port: 0,
            clean_interval: Duration::from_secs(60),
            http: HttpConfig::default(),
            oauth: OAuthConfig::default(),
            whitelist: WhitelistConfig::default(),
            trusted_proxy_cidrs: Vec::new(),
            use_x_forwarded_for: false,
            error_webhook_url: None,
            state_path: None,
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// OAuth client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Client ID
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
    /// Callback URL registered with the provider
    pub redirect_url: String,
    /// Consent page
    pub auth_url: String,
    /// Token endpoint
    pub token_url: String,
    /// Token info endpoint
    pub tokeninfo_url: String,
    /// Revocation endpoint
    pub revoke_url: String,
    /// How long an API client waits for the browser to finish
    #[serde(with = "humantime_serde")]
    pub callback_timeout: Duration,
    /// Budget for exchanging an authorization code
    #[serde(with = "humantime_serde")]
    pub exchange_timeout: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_url: String::new(),
            auth_url: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            tokeninfo_url: "https://oauth2.googleapis.com/tokeninfo".to_string(),
            revoke_url: "https://oauth2.googleapis.com/revoke".to_string(),
            callback_timeout: Duration::from_secs(60),
            exchange_timeout: Duration::from_secs(5),
        }
    }
}

/// Firewall whitelisting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistConfig {
    /// Manage firewall rules at all
    pub enabled: bool,
    /// Period of the self-healing reconcile
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
    /// Dedicated filter chain
    pub chain_name: String,
    /// iptables binary
    pub iptables_path: String,
    /// Limit on any single firewall command
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reconcile_interval: Duration::from_secs(60),
            chain_name: "DRAUPNIR-WHITELIST".to_string(),
            iptables_path: "iptables".to_string(),
            command_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or the merged
    /// configuration cannot be deserialized.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Env files must be loaded before the environment provider reads it
        let env_files: Vec<String> = figment.extract_inner("env_files").unwrap_or_default();
        load_env_files(&env_files);

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Load and validate
    ///
    /// # Errors
    ///
    /// Returns an error if loading fails or [`Config::validate`] rejects the result.
    pub fn load_validated(path: Option<&Path>) -> Result<Self> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields and ranges, reporting every problem at once
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing each missing or invalid field.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let required = [
            ("environment", self.environment.as_str()),
            ("shared_secret", self.shared_secret.as_str()),
            ("trusted_user_email_domain", self.trusted_user_email_domain.as_str()),
            ("public_hostname", self.public_hostname.as_str()),
            ("oauth.client_id", self.oauth.client_id.as_str()),
            ("oauth.client_secret", self.oauth.client_secret.as_str()),
            ("oauth.redirect_url", self.oauth.redirect_url.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                problems.push(format!("{name} is required"));
            }
        }

        if self.data_path.as_os_str().is_empty() {
            problems.push("data_path is required".to_string());
        }
        if self.min_instance_port == 0 {
            problems.push("min_instance_port is required".to_string());
        }
        if self.max_instance_port == 0 {
            problems.push("max_instance_port is required".to_string());
        }
        if self.min_instance_port != 0
            && self.max_instance_port != 0
            && self.min_instance_port >= self.max_instance_port
        {
            problems.push(format!(
                "min_instance_port ({}) must be less than max_instance_port ({})",
                self.min_instance_port, self.max_instance_port
            ));
        }
        if self.clean_interval.is_zero() {
            problems.push("clean_interval must be greater than zero".to_string());
        }
        if self.whitelist.enabled {
            if self.whitelist.reconcile_interval.is_zero() {
                problems.push("whitelist.reconcile_interval must be greater than zero".to_string());
            }
            if self.whitelist.chain_name.trim().is_empty() {
                problems.push("whitelist.chain_name is required".to_string());
            }
        }
        for cidr in &self.trusted_proxy_cidrs {
            if parse_cidr(cidr).is_none() {
                problems.push(format!("trusted_proxy_cidrs: invalid CIDR {cidr:?}"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    /// Whether the integration-test identity provider is in use
    #[must_use]
    pub fn is_test_environment(&self) -> bool {
        self.environment == TEST_ENVIRONMENT
    }

    /// Copy with secrets masked, for printing
    #[must_use]
    pub fn redacted(&self) -> Self {
        fn mask(value: &str) -> String {
            if value.is_empty() { String::new() } else { "***".to_string() }
        }

        let mut config = self.clone();
        config.shared_secret = mask(&config.shared_secret);
        config.oauth.client_secret = mask(&config.oauth.client_secret);
        config.error_webhook_url = config.error_webhook_url.as_deref().map(mask);
        config
    }

    /// Resolve the configuration path from an explicit argument or the default
    #[must_use]
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            }
        }
    }
}

/// Load environment files into the process environment, in order
fn load_env_files(paths: &[String]) {
    for path_str in paths {
        let expanded = expand_home(path_str);
        let path = Path::new(&expanded);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        } else {
            tracing::debug!("Env file not found (skipped): {expanded}");
        }
    }
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Parse `addr/prefix` (or a bare address) into network address and prefix length
#[must_use]
pub fn parse_cidr(cidr: &str) -> Option<(IpAddr, u8)> {
    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr.trim(), Some(prefix.trim())),
        None => (cidr.trim(), None),
    };

    let addr: IpAddr = addr.parse().ok()?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max)?,
        None => max,
    };

    Some((addr, prefix))
}

/// Serde helper for human-readable durations
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        let s = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };
        let s = s.trim();

        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::Write;

    fn valid() -> Config {
        Config {
            shared_secret: "s3cret".to_string(),
            trusted_user_email_domain: "gocardless.com".to_string(),
            public_hostname: "draupnir.example.com".to_string(),
            data_path: PathBuf::from("/var/draupnir"),
            min_instance_port: 5600,
            max_instance_port: 6000,
            oauth: OAuthConfig {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                redirect_url: "https://draupnir.example.com/oauth_callback".to_string(),
                ..OAuthConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn validate_reports_every_missing_field() {
        let err = Config::default().validate().unwrap_err().to_string();
        for field in [
            "shared_secret",
            "trusted_user_email_domain",
            "public_hostname",
            "data_path",
            "min_instance_port",
            "max_instance_port",
            "oauth.client_id",
            "oauth.client_secret",
            "oauth.redirect_url",
        ] {
            assert!(err.contains(field), "{field} missing from: {err}");
        }
    }

    #[test]
    fn validate_rejects_inverted_port_range() {
        let config = Config {
            min_instance_port: 6000,
            max_instance_port: 6000,
            ..valid()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must be less than"));
    }

    #[test]
    fn validate_rejects_bad_proxy_cidr() {
        let config = Config {
            trusted_proxy_cidrs: vec!["10.0.0.0/8".to_string(), "nope".to_string()],
            ..valid()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("\"nope\""));
        assert!(!err.contains("10.0.0.0/8"));
    }

    #[test]
    fn load_yaml_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "shared_secret: abc\nmin_instance_port: 5600\nmax_instance_port: 6000\nclean_interval: 5m\nwhitelist:\n  enabled: true\n  reconcile_interval: 100ms\noauth:\n  client_id: cid"
        )
        .unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.shared_secret, "abc");
        assert_eq!(config.clean_interval, Duration::from_secs(300));
        assert!(config.whitelist.enabled);
        assert_eq!(config.whitelist.reconcile_interval, Duration::from_millis(100));
        assert_eq!(config.whitelist.chain_name, "DRAUPNIR-WHITELIST");
        assert_eq!(config.oauth.client_id, "cid");
        assert_eq!(config.oauth.revoke_url, "https://oauth2.googleapis.com/revoke");
        assert_eq!(config.http.port, 8443);
    }

    #[test]
    fn load_missing_file_fails() {
        let err = Config::load(Some(Path::new("/nonexistent/draupnir.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_environment_detection() {
        let config = Config {
            environment: "test".to_string(),
            ..valid()
        };
        assert!(config.is_test_environment());
        assert!(!valid().is_test_environment());
    }

    #[test]
    fn redacted_masks_secrets_only() {
        let config = Config {
            error_webhook_url: Some("https://hooks.example.com/abc".to_string()),
            ..valid()
        };
        let redacted = config.redacted();
        assert_eq!(redacted.shared_secret, "***");
        assert_eq!(redacted.oauth.client_secret, "***");
        assert_eq!(redacted.error_webhook_url.as_deref(), Some("***"));
        assert_eq!(redacted.oauth.client_id, "id");
        assert_eq!(redacted.public_hostname, config.public_hostname);

        let yaml = serde_yaml::to_string(&redacted).unwrap();
        assert!(!yaml.contains("s3cret"));
    }

    #[test]
    fn cidr_parsing() {
        assert_eq!(parse_cidr("10.0.0.0/8"), Some(("10.0.0.0".parse().unwrap(), 8)));
        assert_eq!(parse_cidr("192.168.1.1"), Some(("192.168.1.1".parse().unwrap(), 32)));
        assert_eq!(parse_cidr("::1/128"), Some(("::1".parse().unwrap(), 128)));
        assert_eq!(parse_cidr("10.0.0.0/33"), None);
        assert_eq!(parse_cidr("garbage/8"), None);
    }

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "DRAUPNIR_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        load_env_files(&[env_path.to_string_lossy().to_string()]);

        assert_eq!(env::var("DRAUPNIR_TEST_KEY_A").unwrap(), "hello_from_env_file");
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        load_env_files(&["/nonexistent/path/.env".to_string()]);
    }

    #[test]
    fn env_file_values_reach_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("draupnir.env");
        std::fs::write(
            &env_path,
            "DRAUPNIR_PUBLIC_HOSTNAME=from-env-file.example\nDRAUPNIR_STATE_PATH=/var/lib/draupnir/state.json\n",
        )
        .unwrap();

        let path = dir.path().join("config.yaml");
        std::fs::write(&path, format!("env_files:\n  - {}\n", env_path.display())).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.public_hostname, "from-env-file.example");
        assert_eq!(
            config.state_path.as_deref(),
            Some(Path::new("/var/lib/draupnir/state.json"))
        );
    }
}
