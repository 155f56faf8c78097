//! cert-manager and the cluster issuer application certificates are requested from.

use std::collections::BTreeMap;
use std::path::Path;

use kiln_core::{KilnResult, ScopedOptions};
use kiln_kubehub::ClusterOps;
use tracing::info;

use crate::common::{delete_owned_namespace, ManifestUnit};
use crate::unit::{render, DeploymentUnit, InstallContext};

pub const ID: &str = "cert-manager";
pub const CLUSTER_ISSUER: &str = "letsencrypt-production";
const ISSUER_MANIFEST: &str = "cluster-issuer.yaml";

const BASE: ManifestUnit = ManifestUnit {
    id: ID,
    title: "cert-manager",
    version: "1.2.0",
    namespace: "cert-manager",
    manifest: "cert-manager.yaml",
    selectors: &["app.kubernetes.io/name=cert-manager", "app.kubernetes.io/name=webhook"],
    needs_domain: false,
    upgradable: true,
    ingress_service: None,
    vars: &[],
};

pub struct CertManager;

impl CertManager {
    fn issuer_yaml(ctx: &InstallContext) -> KilnResult<String> {
        let mut vars = BTreeMap::from([("issuer", CLUSTER_ISSUER.to_string())]);
        if let Some(d) = ctx.system_domain.as_deref() {
            vars.insert("system_domain", d.to_string());
        }
        Ok(render(&ctx.manifests.load(ISSUER_MANIFEST)?, &vars))
    }
}

#[async_trait::async_trait]
impl DeploymentUnit for CertManager {
    fn id(&self) -> &str {
        ID
    }

    fn describe(&self) -> String {
        BASE.summary()
    }

    fn version(&self) -> &str {
        BASE.version
    }

    async fn deploy(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, _options: ScopedOptions<'_>) -> KilnResult<()> {
        // render before the first mutation so a missing file leaves nothing behind
        let issuer = Self::issuer_yaml(ctx)?;
        BASE.install(cluster, ctx, &BTreeMap::new()).await?;
        cluster.apply_manifest(&issuer, None).await?;
        info!(issuer = CLUSTER_ISSUER, "cluster issuer applied");
        Ok(())
    }

    async fn upgrade(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, _options: ScopedOptions<'_>) -> KilnResult<()> {
        BASE.reapply(cluster, ctx, &BTreeMap::new()).await?;
        cluster.apply_manifest(&Self::issuer_yaml(ctx)?, None).await.map(|_| ())
    }

    async fn delete(&self, cluster: &dyn ClusterOps, ctx: &InstallContext) -> KilnResult<()> {
        if !cluster.namespace_exists_and_owned(BASE.namespace).await? {
            info!(ns = BASE.namespace, "namespace missing or not owned by kiln; skipping");
            return Ok(());
        }
        // the issuer is cluster scoped and outlives the namespace
        cluster.delete_manifest(&Self::issuer_yaml(ctx)?, None).await?;
        delete_owned_namespace(cluster, ctx, BASE.namespace).await.map(|_| ())
    }

    async fn backup(&self, _cluster: &dyn ClusterOps, _ctx: &InstallContext, _dir: &Path) -> KilnResult<()> {
        Ok(())
    }

    async fn restore(&self, _cluster: &dyn ClusterOps, _ctx: &InstallContext, _dir: &Path) -> KilnResult<()> {
        Ok(())
    }
}
