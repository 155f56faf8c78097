//! Runtime knobs read from the environment.

use std::path::PathBuf;
use std::time::Duration;

fn env_secs(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// Bounds for every wait performed during install/uninstall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Per-unit readiness bound.
    pub deployment: Duration,
    /// Interval between condition checks.
    pub poll_interval: Duration,
    /// How long to wait for the ingress load-balancer IP.
    pub system_domain: Duration,
    /// Builder image warm-up job.
    pub warmup_job: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            deployment: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            system_domain: Duration::from_secs(120),
            warmup_job: Duration::from_secs(600),
        }
    }
}

impl Timeouts {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            deployment: env_secs("KILN_DEPLOY_TIMEOUT_SECS", d.deployment.as_secs()),
            poll_interval: env_secs("KILN_POLL_INTERVAL_SECS", d.poll_interval.as_secs()).max(Duration::from_millis(100)),
            system_domain: env_secs("KILN_SYSTEM_DOMAIN_TIMEOUT_SECS", d.system_domain.as_secs()),
            warmup_job: env_secs("KILN_WARMUP_TIMEOUT_SECS", d.warmup_job.as_secs()),
        }
    }
}

/// Directory holding subsystem manifests (`KILN_MANIFEST_DIR`, default `./manifests`).
pub fn manifest_dir() -> PathBuf {
    std::env::var_os("KILN_MANIFEST_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("manifests"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let t = Timeouts::default();
        assert!(t.poll_interval < t.deployment);
        assert!(t.system_domain <= t.deployment);
    }
}
