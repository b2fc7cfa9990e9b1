//! YAML configuration.
//!
//! ```yaml
//! root_path: /var/lib/lazysnap
//! verification:
//!   policy: always            # or on-fetch-only; required
//! build:
//!   min_layer_size: 10000000
//!   span_size: 4194304
//! resolver:
//!   timeout: 30s
//!   hosts:
//!     registry.example.com:
//!       username: puller
//!       password: hunter2
//!       mirrors:
//!         - host: mirror.example.com:5000
//!           insecure: true
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lazysnap_oci::{ClientOptions, Credentials, ImageRef};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::index::DEFAULT_SPAN_SIZE;
use crate::resolver::{RegistrySource, Resolver, DEFAULT_FETCH_TIMEOUT};
use crate::verify::VerifyPolicy;
use crate::{Error, Result};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "LAZYSNAP_CONFIG";
/// Environment variable overriding `root_path`.
pub const ROOT_ENV: &str = "LAZYSNAP_ROOT";

pub const DEFAULT_ROOT_PATH: &str = "/var/lib/lazysnap";
pub const DEFAULT_MIN_LAYER_SIZE: u64 = 10_000_000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_root_path")]
    pub root_path: PathBuf,
    /// Required: there is no implicit verification policy.
    pub verification: VerificationConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationConfig {
    pub policy: VerifyPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default = "default_min_layer_size")]
    pub min_layer_size: u64,
    #[serde(default = "default_span_size")]
    pub span_size: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            min_layer_size: DEFAULT_MIN_LAYER_SIZE,
            span_size: DEFAULT_SPAN_SIZE,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    /// Per-attempt timeout, e.g. `30s` or `1m 30s`.
    #[serde(default = "default_timeout", deserialize_with = "duration")]
    pub timeout: Duration,
    /// Keyed by registry host (with port, if any).
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            hosts: BTreeMap::new(),
        }
    }
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Talk plain HTTP to this host.
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "secret")]
    pub password: Option<SecretString>,
    /// Tried in order after the host itself fails.
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("insecure", &self.insecure)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("mirrors", &self.mirrors)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    pub host: String,
    #[serde(default)]
    pub insecure: bool,
}

fn default_root_path() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT_PATH)
}

fn default_min_layer_size() -> u64 {
    DEFAULT_MIN_LAYER_SIZE
}

fn default_span_size() -> u64 {
    DEFAULT_SPAN_SIZE
}

fn default_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read, parse and validate the configuration at `path`, then apply
/// environment overrides.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    let mut config: Config = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid YAML in {}: {}", path.display(), e)))?;
    config.apply_env();
    validate_config(&config)?;
    debug!(path = %path.display(), root = %config.root_path.display(), "loaded configuration");
    Ok(config)
}

/// Parse and validate a YAML document. Environment overrides are not
/// applied.
pub fn parse_config(raw: &str) -> Result<Config> {
    let config: Config =
        serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("invalid YAML: {e}")))?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.root_path.as_os_str().is_empty() {
        return Err(Error::Config("root_path cannot be empty".into()));
    }
    if config.build.span_size == 0 {
        return Err(Error::Config("build.span_size must be greater than zero".into()));
    }
    if config.resolver.timeout.is_zero() {
        return Err(Error::Config("resolver.timeout must be greater than zero".into()));
    }
    for (host, cfg) in &config.resolver.hosts {
        if cfg.password.is_some() && cfg.username.is_none() {
            return Err(Error::Config(format!(
                "resolver.hosts.{host}: password given without username"
            )));
        }
        if let Some(mirror) = cfg.mirrors.iter().find(|m| m.host.trim().is_empty()) {
            return Err(Error::Config(format!(
                "resolver.hosts.{host}: mirror host cannot be empty ({mirror:?})"
            )));
        }
    }
    Ok(())
}

impl Config {
    /// A configuration with every default and the given policy.
    pub fn with_policy(policy: VerifyPolicy) -> Self {
        Self {
            root_path: default_root_path(),
            verification: VerificationConfig { policy },
            build: BuildConfig::default(),
            resolver: ResolverConfig::default(),
        }
    }

    /// Apply `LAZYSNAP_ROOT`.
    pub fn apply_env(&mut self) {
        if let Ok(root) = std::env::var(ROOT_ENV) {
            if !root.is_empty() {
                self.root_path = PathBuf::from(root);
            }
        }
    }

    pub fn policy(&self) -> VerifyPolicy {
        self.verification.policy
    }

    /// Connection options for `image`'s own registry. `credentials`
    /// overrides any configured for the host.
    pub fn client_options_for(
        &self,
        image: &ImageRef,
        credentials: Option<Credentials>,
    ) -> ClientOptions {
        let host = self.resolver.hosts.get(&image.registry);
        let credentials = credentials.or_else(|| {
            let host = host?;
            match (&host.username, &host.password) {
                (Some(username), Some(password)) => Some(Credentials {
                    username: username.clone(),
                    password: SecretString::from(password.expose_secret().to_string()),
                }),
                _ => None,
            }
        });
        ClientOptions {
            plain_http: host.is_some_and(|h| h.insecure),
            credentials,
        }
    }

    /// Build the resolver for `image`: its registry first, then the mirrors
    /// configured for that registry. Credentials, as in
    /// [`Config::client_options_for`], are sent to the primary only.
    pub fn resolver_for(&self, image: &ImageRef, credentials: Option<Credentials>) -> Result<Resolver> {
        let mirrors = self
            .resolver
            .hosts
            .get(&image.registry)
            .map(|h| h.mirrors.as_slice())
            .unwrap_or_default();

        let primary =
            RegistrySource::new(image.clone(), self.client_options_for(image, credentials))?;
        let mut resolver = Resolver::new(Arc::new(primary)).with_timeout(self.resolver.timeout);

        for mirror in mirrors {
            let source = RegistrySource::new(
                image.with_registry(&mirror.host),
                ClientOptions {
                    plain_http: mirror.insecure,
                    credentials: None,
                },
            )?;
            resolver = resolver.with_mirror(Arc::new(source));
        }
        debug!(
            image = %image.registry,
            sources = ?resolver.source_names(),
            "configured resolver",
        );
        Ok(resolver)
    }
}
