//! Typed configuration domains and the immutable snapshot that bundles them.
//!
//! Each domain is parsed from a flat string map in one go. A domain either
//! parses completely or not at all, so readers never see malformed values.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::RequestContext;

/// Name of the domain holding defaulting tunables.
pub const DEFAULTS_CONFIG_NAME: &str = "config-defaults";
/// Name of the domain holding feature flags.
pub const FEATURES_CONFIG_NAME: &str = "config-features";

pub const DEFAULT_REVISION_TIMEOUT_SECONDS: i64 = 300;
pub const DEFAULT_MAX_REVISION_TIMEOUT_SECONDS: i64 = 600;
pub const DEFAULT_CONTAINER_CONCURRENCY: i64 = 0;
pub const DEFAULT_CONTAINER_CONCURRENCY_MAX_LIMIT: i64 = 1000;
pub const DEFAULT_USER_CONTAINER_NAME: &str = "user-container";
pub const DEFAULT_ENABLE_SERVICE_LINKS: Option<bool> = Some(false);

// Keys of the defaults domain
const REVISION_TIMEOUT_KEY: &str = "revision-timeout-seconds";
const MAX_REVISION_TIMEOUT_KEY: &str = "max-revision-timeout-seconds";
const RESPONSE_START_TIMEOUT_KEY: &str = "revision-response-start-timeout-seconds";
const IDLE_TIMEOUT_KEY: &str = "revision-idle-timeout-seconds";
const CONTAINER_NAME_KEY: &str = "container-name-template";
const CONTAINER_CONCURRENCY_KEY: &str = "container-concurrency";
const CONTAINER_CONCURRENCY_MAX_KEY: &str = "container-concurrency-max-limit";
const ENABLE_SERVICE_LINKS_KEY: &str = "enable-service-links";

static QUANTITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+|Ki|Mi|Gi|Ti|Pi|Ei|n|u|m|k|M|G|T|P|E)?$")
        .expect("quantity regex")
});
static DNS_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("dns label regex"));

/// Parse failure for a single configuration key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: invalid integer {value:?}")]
    InvalidInt { key: String, value: String },
    #[error("{key}: invalid boolean {value:?}")]
    InvalidBool { key: String, value: String },
    #[error("{key}: invalid quantity {value:?}")]
    InvalidQuantity { key: String, value: String },
    #[error("{key}: {value:?} is not a valid DNS-1123 label")]
    InvalidName { key: String, value: String },
    #[error("{key}: invalid flag {value:?} (expect Enabled, Disabled or Allowed)")]
    InvalidFlag { key: String, value: String },
    #[error("{key}: {value} out of range [{min}, {max}]")]
    OutOfRange { key: String, value: i64, min: i64, max: i64 },
}

/// Tunables used when an object leaves a field unset.
#[derive(Debug, Clone, PartialEq)]
pub struct Defaults {
    pub revision_timeout: Duration,
    pub max_revision_timeout: Duration,
    /// Unset means requests inherit `revision_timeout`.
    pub revision_response_start_timeout: Option<Duration>,
    pub revision_idle_timeout: Option<Duration>,
    pub user_container_name: String,
    pub container_concurrency: i64,
    pub container_concurrency_max_limit: i64,
    /// `None` leaves the pod field unset.
    pub enable_service_links: Option<bool>,
    pub revision_cpu_request: Option<Quantity>,
    pub revision_cpu_limit: Option<Quantity>,
    pub revision_memory_request: Option<Quantity>,
    pub revision_memory_limit: Option<Quantity>,
    pub revision_ephemeral_storage_request: Option<Quantity>,
    pub revision_ephemeral_storage_limit: Option<Quantity>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            revision_timeout: secs(DEFAULT_REVISION_TIMEOUT_SECONDS),
            max_revision_timeout: secs(DEFAULT_MAX_REVISION_TIMEOUT_SECONDS),
            revision_response_start_timeout: None,
            revision_idle_timeout: None,
            user_container_name: DEFAULT_USER_CONTAINER_NAME.to_string(),
            container_concurrency: DEFAULT_CONTAINER_CONCURRENCY,
            container_concurrency_max_limit: DEFAULT_CONTAINER_CONCURRENCY_MAX_LIMIT,
            enable_service_links: DEFAULT_ENABLE_SERVICE_LINKS,
            revision_cpu_request: None,
            revision_cpu_limit: None,
            revision_memory_request: None,
            revision_memory_limit: None,
            revision_ephemeral_storage_request: None,
            revision_ephemeral_storage_limit: None,
        }
    }
}

impl Defaults {
    /// Parse the defaults domain; keys not present keep their built-in value.
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut d = Self::default();

        if let Some(v) = seconds(data, MAX_REVISION_TIMEOUT_KEY)? {
            d.max_revision_timeout = v;
        }
        if let Some(v) = seconds(data, REVISION_TIMEOUT_KEY)? {
            d.revision_timeout = v;
        }
        d.revision_response_start_timeout = seconds(data, RESPONSE_START_TIMEOUT_KEY)?;
        d.revision_idle_timeout = seconds(data, IDLE_TIMEOUT_KEY)?;

        let max = d.max_revision_timeout.as_secs() as i64;
        within(REVISION_TIMEOUT_KEY, d.revision_timeout.as_secs() as i64, 0, max)?;
        if let Some(v) = d.revision_response_start_timeout {
            within(RESPONSE_START_TIMEOUT_KEY, v.as_secs() as i64, 0, max)?;
        }
        if let Some(v) = d.revision_idle_timeout {
            within(IDLE_TIMEOUT_KEY, v.as_secs() as i64, 0, max)?;
        }

        if let Some(raw) = data.get(CONTAINER_NAME_KEY) {
            let name = raw.trim();
            if name.len() > 63 || !DNS_LABEL_RE.is_match(name) {
                return Err(ConfigError::InvalidName { key: CONTAINER_NAME_KEY.into(), value: raw.clone() });
            }
            d.user_container_name = name.to_string();
        }

        if let Some(v) = int(data, CONTAINER_CONCURRENCY_MAX_KEY)? {
            within(CONTAINER_CONCURRENCY_MAX_KEY, v, 1, i64::from(i32::MAX))?;
            d.container_concurrency_max_limit = v;
        }
        if let Some(v) = int(data, CONTAINER_CONCURRENCY_KEY)? {
            d.container_concurrency = v;
        }
        within(CONTAINER_CONCURRENCY_KEY, d.container_concurrency, 0, d.container_concurrency_max_limit)?;

        if let Some(raw) = data.get(ENABLE_SERVICE_LINKS_KEY) {
            d.enable_service_links = match raw.trim().to_ascii_lowercase().as_str() {
                "default" => None,
                "true" => Some(true),
                "false" => Some(false),
                _ => {
                    return Err(ConfigError::InvalidBool { key: ENABLE_SERVICE_LINKS_KEY.into(), value: raw.clone() })
                }
            };
        }

        d.revision_cpu_request = quantity(data, "revision-cpu-request")?;
        d.revision_cpu_limit = quantity(data, "revision-cpu-limit")?;
        d.revision_memory_request = quantity(data, "revision-memory-request")?;
        d.revision_memory_limit = quantity(data, "revision-memory-limit")?;
        d.revision_ephemeral_storage_request = quantity(data, "revision-ephemeral-storage-request")?;
        d.revision_ephemeral_storage_limit = quantity(data, "revision-ephemeral-storage-limit")?;
        Ok(d)
    }

    /// `(resource name, request default, limit default)` for every defaulted resource.
    pub fn resource_defaults(&self) -> [(&'static str, Option<&Quantity>, Option<&Quantity>); 3] {
        [
            ("cpu", self.revision_cpu_request.as_ref(), self.revision_cpu_limit.as_ref()),
            ("memory", self.revision_memory_request.as_ref(), self.revision_memory_limit.as_ref()),
            (
                "ephemeral-storage",
                self.revision_ephemeral_storage_request.as_ref(),
                self.revision_ephemeral_storage_limit.as_ref(),
            ),
        ]
    }
}

/// Tri-state feature flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Enabled,
    Disabled,
    /// Usable when the object opts in, off otherwise.
    Allowed,
}

impl FromStr for Flag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" => Ok(Flag::Enabled),
            "disabled" => Ok(Flag::Disabled),
            "allowed" => Ok(Flag::Allowed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Features {
    /// Harden container security contexts where the object leaves them open.
    pub secure_pod_defaults: Flag,
}

impl Default for Features {
    fn default() -> Self {
        Self { secure_pod_defaults: Flag::Disabled }
    }
}

impl Features {
    /// Parse the features domain. Unknown keys are ignored.
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut f = Self::default();
        f.secure_pod_defaults = flag(data, "secure-pod-defaults")?.unwrap_or(f.secure_pod_defaults);
        Ok(f)
    }
}

/// Immutable point-in-time view of every configuration domain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Bumped on every successful swap; 0 for the built-in snapshot.
    pub epoch: u64,
    pub defaults: Arc<Defaults>,
    pub features: Arc<Features>,
}

static BUILTIN: Lazy<Arc<Config>> = Lazy::new(|| Arc::new(Config::default()));

impl Config {
    /// Snapshot attached to `ctx`, or the built-in defaults when none is.
    pub fn from_context(ctx: &RequestContext<'_>) -> Arc<Config> {
        match ctx.config() {
            Some(cfg) => Arc::clone(cfg),
            None => Arc::clone(&BUILTIN),
        }
    }
}

fn secs(v: i64) -> Duration {
    Duration::from_secs(v.max(0) as u64)
}

fn int(data: &BTreeMap<String, String>, key: &str) -> Result<Option<i64>, ConfigError> {
    match data.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidInt { key: key.to_string(), value: raw.clone() }),
    }
}

fn seconds(data: &BTreeMap<String, String>, key: &str) -> Result<Option<Duration>, ConfigError> {
    match int(data, key)? {
        None => Ok(None),
        Some(v) if v < 0 => Err(ConfigError::OutOfRange { key: key.to_string(), value: v, min: 0, max: i64::MAX }),
        Some(v) => Ok(Some(secs(v))),
    }
}

fn quantity(data: &BTreeMap<String, String>, key: &str) -> Result<Option<Quantity>, ConfigError> {
    match data.get(key) {
        None => Ok(None),
        Some(raw) if QUANTITY_RE.is_match(raw.trim()) => Ok(Some(Quantity(raw.trim().to_string()))),
        Some(raw) => Err(ConfigError::InvalidQuantity { key: key.to_string(), value: raw.clone() }),
    }
}

fn flag(data: &BTreeMap<String, String>, key: &str) -> Result<Option<Flag>, ConfigError> {
    match data.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidFlag { key: key.to_string(), value: raw.clone() }),
    }
}

fn within(key: &str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange { key: key.to_string(), value, min, max });
    }
    Ok(())
}
