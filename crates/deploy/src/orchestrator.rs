//! Sequences deployment units over one cluster.
//!
//! Units run strictly one after another in the order they were given. The first failure stops
//! the run and is handed back unchanged; nothing is rolled back.

use std::path::Path;
use std::time::Instant;

use kiln_core::{synthesize_domain, KilnError, KilnResult, OptionOrigin, OptionSet};
use kiln_kubehub::{wait, ClusterOps};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{info, warn};

use crate::unit::{DeploymentUnit, InstallContext};

/// Name of the global option carrying the system domain.
pub const SYSTEM_DOMAIN: &str = "system_domain";
const BACKUP_INDEX: &str = "backup.json";

#[derive(Debug, Clone, Serialize)]
pub struct UnitSummary {
    pub id: String,
    pub version: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
struct BackupIndex<'a> {
    created_at: String,
    units: Vec<&'a str>,
}

pub struct Orchestrator<'c, U: DeploymentUnit> {
    cluster: &'c dyn ClusterOps,
    units: Vec<U>,
    ctx: InstallContext,
}

impl<'c, U: DeploymentUnit> Orchestrator<'c, U> {
    pub fn new(cluster: &'c dyn ClusterOps, units: Vec<U>, ctx: InstallContext) -> Self {
        Self { cluster, units, ctx }
    }

    pub fn units(&self) -> &[U] {
        &self.units
    }

    pub fn system_domain(&self) -> Option<&str> {
        self.ctx.system_domain.as_deref()
    }

    pub fn describe(&self) -> Vec<UnitSummary> {
        self.units
            .iter()
            .map(|u| UnitSummary { id: u.id().to_string(), version: u.version().to_string(), description: u.describe() })
            .collect()
    }

    fn adopt_configured_domain(&mut self, options: &OptionSet) -> KilnResult<()> {
        if options.get(SYSTEM_DOMAIN).is_none() {
            return Ok(());
        }
        let domain = options.get_string(SYSTEM_DOMAIN)?;
        if !domain.is_empty() {
            info!(domain = %domain, "using configured system domain");
            self.ctx.system_domain = Some(domain);
        }
        Ok(())
    }

    /// Poll the ingress service for a load-balancer address. A timeout leaves the domain unset.
    async fn resolve_domain(&mut self, service: &str, options: &mut OptionSet) -> KilnResult<()> {
        if self.ctx.system_domain.as_deref().is_some_and(|d| !d.is_empty()) {
            return Ok(());
        }
        let selector = format!("metadata.name={}", service);
        let t = &self.ctx.timeouts;
        match wait::wait_for_external_ip(self.cluster, &selector, t.poll_interval, t.system_domain).await {
            Ok(ip) => {
                let domain = synthesize_domain(&ip);
                info!(service = %service, ip = %ip, domain = %domain, "system domain resolved");
                if options.get(SYSTEM_DOMAIN).is_some() {
                    options.set(SYSTEM_DOMAIN, domain.clone(), OptionOrigin::Computed)?;
                }
                self.ctx.system_domain = Some(domain);
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                warn!(service = %service, error = %e, "no external address; system domain left empty");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Deploy every unit in order. Fails with the first unit error.
    pub async fn install(&mut self, options: &mut OptionSet) -> KilnResult<()> {
        self.adopt_configured_domain(options)?;
        for idx in 0..self.units.len() {
            let unit = &self.units[idx];
            let id = unit.id().to_string();
            let ingress = unit.ingress_service().map(str::to_string);
            counter!("deploy_attempts", 1u64);
            let t0 = Instant::now();
            info!(unit = %id, "deploy start");
            match unit.deploy(self.cluster, &self.ctx, options.for_deployment(&id)).await {
                Ok(()) => {
                    counter!("deploy_ok", 1u64);
                    histogram!("deploy_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    info!(unit = %id, elapsed_ms = t0.elapsed().as_millis() as u64, "deploy done");
                }
                Err(e) => {
                    counter!("deploy_err", 1u64);
                    warn!(unit = %id, error = %e, "deploy failed; stopping");
                    return Err(e);
                }
            }
            if let Some(service) = ingress {
                self.resolve_domain(&service, options).await?;
            }
        }
        Ok(())
    }

    /// Upgrade every unit in install order.
    pub async fn upgrade(&mut self, options: &mut OptionSet) -> KilnResult<()> {
        self.adopt_configured_domain(options)?;
        for idx in 0..self.units.len() {
            let unit = &self.units[idx];
            let id = unit.id().to_string();
            let ingress = unit.ingress_service().map(str::to_string);
            info!(unit = %id, version = unit.version(), "upgrade start");
            if let Err(e) = unit.upgrade(self.cluster, &self.ctx, options.for_deployment(&id)).await {
                warn!(unit = %id, error = %e, "upgrade failed; stopping");
                return Err(e);
            }
            if let Some(service) = ingress {
                self.resolve_domain(&service, options).await?;
            }
        }
        Ok(())
    }

    /// Delete every unit in reverse install order.
    pub async fn uninstall(&self) -> KilnResult<()> {
        for unit in self.units.iter().rev() {
            info!(unit = unit.id(), "delete start");
            if let Err(e) = unit.delete(self.cluster, &self.ctx).await {
                warn!(unit = unit.id(), error = %e, "delete failed; stopping");
                return Err(e);
            }
        }
        info!("uninstalled");
        Ok(())
    }

    /// Back every unit up into `<dir>/<unit id>/` and write an index next to them.
    pub async fn backup(&self, dir: &Path) -> KilnResult<()> {
        std::fs::create_dir_all(dir)?;
        for unit in &self.units {
            let sub = dir.join(unit.id());
            std::fs::create_dir_all(&sub)?;
            unit.backup(self.cluster, &self.ctx, &sub).await?;
        }
        let index = BackupIndex {
            created_at: chrono::Utc::now().to_rfc3339(),
            units: self.units.iter().map(|u| u.id()).collect(),
        };
        std::fs::write(dir.join(BACKUP_INDEX), serde_json::to_vec_pretty(&index)?)?;
        info!(dir = %dir.display(), units = self.units.len(), "backup written");
        Ok(())
    }

    /// Restore every unit from `<dir>/<unit id>/`. Units without a sub-directory are skipped.
    pub async fn restore(&self, dir: &Path) -> KilnResult<()> {
        if !dir.is_dir() {
            return Err(KilnError::NotFound(format!("backup directory {}", dir.display())));
        }
        for unit in &self.units {
            let sub = dir.join(unit.id());
            if !sub.is_dir() {
                info!(unit = unit.id(), "nothing to restore");
                continue;
            }
            unit.restore(self.cluster, &self.ctx, &sub).await?;
        }
        info!(dir = %dir.display(), "restore done");
        Ok(())
    }
}
