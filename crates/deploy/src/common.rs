//! Steps shared by the units: ownership-checked namespaces and the manifest-backed unit shape.

use std::collections::BTreeMap;
use std::path::Path;

use kiln_core::{is_owned, KilnError, KilnResult, ScopedOptions, OWNERSHIP_LABEL_KEY, OWNERSHIP_LABEL_VALUE};
use kiln_kubehub::{wait, ClusterOps};
use tracing::info;

use crate::unit::{render, DeploymentUnit, InstallContext};

/// `AlreadyPresent` when `namespace` exists, owned or not.
pub(crate) async fn ensure_absent(cluster: &dyn ClusterOps, unit: &str, namespace: &str) -> KilnResult<()> {
    if cluster.get_namespace(namespace).await?.is_some() {
        return Err(KilnError::AlreadyPresent(format!("{}: namespace {} present already", unit, namespace)));
    }
    Ok(())
}

/// `Ok(true)` when `namespace` exists and is ours, `Ok(false)` when missing, `NotOwned` otherwise.
pub(crate) async fn ensure_absent_or_owned(cluster: &dyn ClusterOps, namespace: &str) -> KilnResult<bool> {
    match cluster.get_namespace(namespace).await? {
        None => Ok(false),
        Some(ns) if ns.metadata.labels.as_ref().map(is_owned).unwrap_or(false) => Ok(true),
        Some(_) => Err(KilnError::NotOwned(format!("namespace {} exists and was not created by kiln", namespace))),
    }
}

pub(crate) async fn create_owned_namespace(cluster: &dyn ClusterOps, namespace: &str, extra: &[(&str, &str)]) -> KilnResult<()> {
    let mut labels: BTreeMap<String, String> = extra.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    labels.insert(OWNERSHIP_LABEL_KEY.to_string(), OWNERSHIP_LABEL_VALUE.to_string());
    cluster.create_namespace(namespace, labels).await
}

/// Delete `namespace` and wait until it is gone. `Ok(false)` when skipped because it is missing
/// or not ours.
pub(crate) async fn delete_owned_namespace(cluster: &dyn ClusterOps, ctx: &InstallContext, namespace: &str) -> KilnResult<bool> {
    if !cluster.namespace_exists_and_owned(namespace).await? {
        info!(ns = %namespace, "namespace missing or not owned by kiln; skipping");
        return Ok(false);
    }
    cluster.delete_namespace(namespace).await?;
    wait::wait_for_namespace_gone(cluster, namespace, ctx.timeouts.poll_interval, ctx.timeouts.deployment).await?;
    info!(ns = %namespace, "namespace removed");
    Ok(true)
}

pub(crate) async fn wait_ready(cluster: &dyn ClusterOps, ctx: &InstallContext, namespace: &str, selectors: &[&str]) -> KilnResult<()> {
    for sel in selectors {
        wait::wait_for_workload(cluster, namespace, sel, ctx.timeouts.poll_interval, ctx.timeouts.deployment).await?;
    }
    Ok(())
}

/// A unit that is one owned namespace, one manifest and a set of pods to wait for.
#[derive(Debug, Clone, Copy)]
pub struct ManifestUnit {
    pub id: &'static str,
    pub title: &'static str,
    pub version: &'static str,
    pub namespace: &'static str,
    pub manifest: &'static str,
    /// Pods that must run before the unit counts as ready.
    pub selectors: &'static [&'static str],
    pub needs_domain: bool,
    /// Upgrade re-applies the manifest; otherwise upgrade is a no-op.
    pub upgradable: bool,
    pub ingress_service: Option<&'static str>,
    /// Fixed template values besides `namespace` and `system_domain`.
    pub vars: &'static [(&'static str, &'static str)],
}

impl ManifestUnit {
    fn vars(&self, ctx: &InstallContext) -> KilnResult<BTreeMap<&'static str, String>> {
        let mut vars: BTreeMap<&'static str, String> = self.vars.iter().map(|(k, v)| (*k, v.to_string())).collect();
        vars.insert("namespace", self.namespace.to_string());
        if self.needs_domain {
            vars.insert("system_domain", ctx.require_domain(self.id)?.to_string());
        } else if let Some(d) = ctx.system_domain.as_deref() {
            vars.insert("system_domain", d.to_string());
        }
        Ok(vars)
    }

    pub(crate) fn rendered(&self, ctx: &InstallContext, extra: &BTreeMap<&'static str, String>) -> KilnResult<String> {
        let mut vars = self.vars(ctx)?;
        vars.extend(extra.iter().map(|(k, v)| (*k, v.clone())));
        Ok(render(&ctx.manifests.load(self.manifest)?, &vars))
    }

    /// Fresh install: presence check, namespace, manifest, readiness.
    pub(crate) async fn install(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, extra: &BTreeMap<&'static str, String>) -> KilnResult<()> {
        let yaml = self.prepare(cluster, ctx, extra).await?;
        self.apply(cluster, ctx, &yaml).await
    }

    /// Presence check, render, then the owned namespace. Hands back the rendered manifest so
    /// callers can seed the namespace before anything in it starts.
    pub(crate) async fn prepare(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, extra: &BTreeMap<&'static str, String>) -> KilnResult<String> {
        ensure_absent(cluster, self.id, self.namespace).await?;
        let yaml = self.rendered(ctx, extra)?;
        info!(unit = self.id, ns = self.namespace, "deploying");
        create_owned_namespace(cluster, self.namespace, &[]).await?;
        Ok(yaml)
    }

    pub(crate) async fn apply(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, yaml: &str) -> KilnResult<()> {
        cluster.apply_manifest(yaml, None).await?;
        wait_ready(cluster, ctx, self.namespace, self.selectors).await?;
        info!(unit = self.id, "deployed");
        Ok(())
    }

    /// Re-apply onto an existing, Kiln-owned install.
    pub(crate) async fn reapply(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, extra: &BTreeMap<&'static str, String>) -> KilnResult<()> {
        if !cluster.namespace_exists_and_owned(self.namespace).await? {
            return Err(KilnError::NotFound(format!("{} is not installed", self.id)));
        }
        let yaml = self.rendered(ctx, extra)?;
        cluster.apply_manifest(&yaml, None).await?;
        wait_ready(cluster, ctx, self.namespace, self.selectors).await?;
        info!(unit = self.id, version = self.version, "upgraded");
        Ok(())
    }

    pub(crate) fn summary(&self) -> String {
        format!("{} ({}) version {}", self.title, self.id, self.version)
    }
}

#[async_trait::async_trait]
impl DeploymentUnit for ManifestUnit {
    fn id(&self) -> &str {
        self.id
    }

    fn describe(&self) -> String {
        self.summary()
    }

    fn version(&self) -> &str {
        self.version
    }

    fn ingress_service(&self) -> Option<&str> {
        self.ingress_service
    }

    async fn deploy(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, _options: ScopedOptions<'_>) -> KilnResult<()> {
        self.install(cluster, ctx, &BTreeMap::new()).await
    }

    async fn upgrade(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, _options: ScopedOptions<'_>) -> KilnResult<()> {
        if !self.upgradable {
            info!(unit = self.id, "no upgrade steps");
            return Ok(());
        }
        self.reapply(cluster, ctx, &BTreeMap::new()).await
    }

    async fn delete(&self, cluster: &dyn ClusterOps, ctx: &InstallContext) -> KilnResult<()> {
        delete_owned_namespace(cluster, ctx, self.namespace).await.map(|_| ())
    }

    async fn backup(&self, _cluster: &dyn ClusterOps, _ctx: &InstallContext, _dir: &Path) -> KilnResult<()> {
        Ok(())
    }

    async fn restore(&self, _cluster: &dyn ClusterOps, _ctx: &InstallContext, _dir: &Path) -> KilnResult<()> {
        Ok(())
    }
}
