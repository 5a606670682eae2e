//! Operator-level runtime configuration — the ambient counterpart to the
//! teacher's `product_config.load(&[...])` call, generalized to env vars since this
//! controller's own "product config" is the generator in [`generator`], not a
//! property-file schema.

pub mod generator;
pub mod manifests;

use std::time::Duration;

/// Tunables that are not themselves part of the NodePool spec, with the defaults
/// named throughout spec §4.2/§4.3/§4.4.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    /// Namespace holding the hosted control plane's core config, tokens, and
    /// downstream CAPI resources for every NodePool this operator watches.
    pub control_plane_namespace: String,

    /// Default token/user-data-Secret expiry grace period after a generation goes
    /// stale (spec §4.2, §4.8): 2 hours.
    pub token_expiry_grace: Duration,

    /// Default `NodeReady` unhealthy timeout for non-Agent/None platforms (spec §4.4).
    pub default_unhealthy_timeout: Duration,

    /// Default `MachineHealthCheck.maxUnhealthy` (spec §4.4).
    pub default_max_unhealthy: i32,

    /// Default `MachineHealthCheck.nodeStartupTimeout` (spec §4.4).
    pub default_node_startup_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            control_plane_namespace: "hypershift".to_string(),
            token_expiry_grace: Duration::from_secs(2 * 60 * 60),
            default_unhealthy_timeout: Duration::from_secs(8 * 60),
            default_max_unhealthy: 2,
            default_node_startup_timeout: Duration::from_secs(20 * 60),
        }
    }
}

impl RuntimeConfig {
    /// Loads overrides from the environment, falling back to [`RuntimeConfig::default`]
    /// for anything unset or unparseable — mirroring the teacher's well-known-paths
    /// loading in spirit, generalized to env vars.
    pub fn from_env() -> Self {
        let defaults = RuntimeConfig::default();
        RuntimeConfig {
            control_plane_namespace: std::env::var("CONTROL_PLANE_NAMESPACE")
                .unwrap_or(defaults.control_plane_namespace),
            token_expiry_grace: env_duration_secs(
                "TOKEN_EXPIRY_GRACE_SECONDS",
                defaults.token_expiry_grace,
            ),
            default_unhealthy_timeout: env_duration_secs(
                "DEFAULT_UNHEALTHY_TIMEOUT_SECONDS",
                defaults.default_unhealthy_timeout,
            ),
            default_max_unhealthy: std::env::var("DEFAULT_MAX_UNHEALTHY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_max_unhealthy),
            default_node_startup_timeout: env_duration_secs(
                "DEFAULT_NODE_STARTUP_TIMEOUT_SECONDS",
                defaults.default_node_startup_timeout,
            ),
        }
    }
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.token_expiry_grace, Duration::from_secs(7200));
        assert_eq!(cfg.default_unhealthy_timeout, Duration::from_secs(480));
        assert_eq!(cfg.default_max_unhealthy, 2);
        assert_eq!(cfg.default_node_startup_timeout, Duration::from_secs(1200));
    }
}
