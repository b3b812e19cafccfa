//! Process-wide settings
//!
//! [`Settings`] is built once at process start and passed by reference into
//! every backend, manager and orchestrator constructor. No other component reads
//! the environment.
//!
//! Resolution (highest priority first):
//! 1. Values set explicitly through the builder methods
//! 2. Environment variables (`STRATA_BACKEND`, `AWS_REGION`, ...)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryConfig;
use crate::telemetry::{LogFormat, LoggingConfig};
use crate::wait::WaitPolicy;

const CONFIG_DIR_NAME: &str = ".strata";
const KUBECONFIG_DIR_NAME: &str = "kubeconfigs";

/// Default backend location when none is configured
pub const DEFAULT_BACKEND_URL: &str = "file://.strata";
/// Default cloud region
pub const DEFAULT_REGION: &str = "us-east-1";

const BACKEND_ENV: &str = "STRATA_BACKEND";
const OWNER_ENV: &str = "STRATA_OWNER";
const KUBECONFIG_DIR_ENV: &str = "STRATA_KUBECONFIG_DIR";
const LOG_FORMAT_ENV: &str = "STRATA_LOG_FORMAT";

/// Wait budgets for every polled resource class
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Pause after creating an IAM role or instance profile
    pub iam_settle: Duration,
    /// Virtual network becoming available
    pub vpc: WaitPolicy,
    /// NAT gateway becoming available
    pub nat_gateway: WaitPolicy,
    /// Control plane becoming active
    pub control_plane: WaitPolicy,
    /// Node group becoming active
    pub node_group: WaitPolicy,
    /// Scaling or version update completing
    pub update: WaitPolicy,
    /// NAT gateway deletion
    pub nat_gateway_delete: WaitPolicy,
    /// Node group deletion
    pub node_group_delete: WaitPolicy,
    /// Control plane deletion
    pub control_plane_delete: WaitPolicy,
    /// Lock table becoming active after creation
    pub lock_table: WaitPolicy,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            iam_settle: Duration::from_secs(10),
            vpc: WaitPolicy::secs(5, 5 * 60),
            nat_gateway: WaitPolicy::secs(15, 10 * 60),
            control_plane: WaitPolicy::secs(30, 30 * 60),
            node_group: WaitPolicy::secs(30, 20 * 60),
            update: WaitPolicy::secs(30, 60 * 60),
            nat_gateway_delete: WaitPolicy::secs(15, 10 * 60),
            node_group_delete: WaitPolicy::secs(30, 20 * 60),
            control_plane_delete: WaitPolicy::secs(30, 20 * 60),
            lock_table: WaitPolicy::secs(2, 2 * 60),
        }
    }
}

impl Timeouts {
    /// Zero-interval waits with a short ceiling, for simulated clouds
    pub fn immediate() -> Self {
        let fast = WaitPolicy::new(Duration::ZERO, Duration::from_secs(5));
        Self {
            iam_settle: Duration::ZERO,
            vpc: fast,
            nat_gateway: fast,
            control_plane: fast,
            node_group: fast,
            update: fast,
            nat_gateway_delete: fast,
            node_group_delete: fast,
            control_plane_delete: fast,
            lock_table: fast,
        }
    }
}

/// Explicit configuration shared by every component
#[derive(Clone, Debug)]
pub struct Settings {
    /// State backend location (`s3://bucket/path?lock_table=...`, `file://dir`)
    pub backend_url: String,
    /// Default cloud region for the backend and providers
    pub region: String,
    /// Identity recorded in lock records (`user@host`)
    pub owner: String,
    /// Directory generated kubeconfigs are written to
    pub kubeconfig_dir: PathBuf,
    /// Wait budgets per resource class
    pub timeouts: Timeouts,
    /// Retry policy for transient backend calls
    pub retry: RetryConfig,
    /// Log output configuration
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            region: DEFAULT_REGION.to_string(),
            owner: "strata".to_string(),
            kubeconfig_dir: PathBuf::from(CONFIG_DIR_NAME).join(KUBECONFIG_DIR_NAME),
            timeouts: Timeouts::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    /// Build settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let owner = get(OWNER_ENV).unwrap_or_else(|| {
            let user = get("USER").unwrap_or_else(|| "unknown".to_string());
            let host = get("HOSTNAME").unwrap_or_else(|| "localhost".to_string());
            format!("{}@{}", user, host)
        });

        let kubeconfig_dir = get(KUBECONFIG_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(KUBECONFIG_DIR_NAME)))
            .unwrap_or(defaults.kubeconfig_dir);

        let format = match get(LOG_FORMAT_ENV).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self {
            backend_url: get(BACKEND_ENV).unwrap_or(defaults.backend_url),
            region: get("AWS_REGION")
                .or_else(|| get("AWS_DEFAULT_REGION"))
                .unwrap_or(defaults.region),
            owner,
            kubeconfig_dir,
            timeouts: defaults.timeouts,
            retry: defaults.retry,
            logging: LoggingConfig {
                format,
                ..defaults.logging
            },
        }
    }

    /// Override the backend location
    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self
    }

    /// Override the region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Override the lock owner identity
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Override the kubeconfig output directory
    pub fn with_kubeconfig_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kubeconfig_dir = dir.into();
        self
    }

    /// Override wait budgets
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_values_override_defaults() {
        let settings = Settings::from_lookup(lookup(&[
            ("STRATA_BACKEND", "s3://state-bucket/prod?lock_table=locks"),
            ("AWS_REGION", "eu-west-1"),
            ("STRATA_OWNER", "ci@runner-7"),
            ("STRATA_KUBECONFIG_DIR", "/tmp/kc"),
            ("STRATA_LOG_FORMAT", "json"),
        ]));

        assert_eq!(settings.backend_url, "s3://state-bucket/prod?lock_table=locks");
        assert_eq!(settings.region, "eu-west-1");
        assert_eq!(settings.owner, "ci@runner-7");
        assert_eq!(settings.kubeconfig_dir, PathBuf::from("/tmp/kc"));
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn region_falls_back_to_default_region_var() {
        let settings = Settings::from_lookup(lookup(&[("AWS_DEFAULT_REGION", "ap-south-1")]));
        assert_eq!(settings.region, "ap-south-1");
    }

    #[test]
    fn owner_is_derived_from_user_and_host() {
        let settings =
            Settings::from_lookup(lookup(&[("USER", "alice"), ("HOSTNAME", "build-01")]));
        assert_eq!(settings.owner, "alice@build-01");
    }

    #[test]
    fn empty_values_are_ignored() {
        let settings = Settings::from_lookup(lookup(&[("STRATA_BACKEND", "")]));
        assert_eq!(settings.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(settings.region, DEFAULT_REGION);
    }

    #[test]
    fn default_timeouts_are_bounded() {
        let t = Timeouts::default();
        assert_eq!(t.control_plane.timeout, Duration::from_secs(30 * 60));
        assert!(t.iam_settle < t.vpc.timeout);
        assert!(Timeouts::immediate().node_group.interval.is_zero());
    }
}
