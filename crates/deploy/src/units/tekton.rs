//! Tekton pipelines plus the staging namespace where build pipeline runs are created.

use std::collections::BTreeMap;
use std::path::Path;

use kiln_core::{KilnResult, ScopedOptions};
use kiln_kubehub::ClusterOps;
use tracing::info;

use crate::common::{create_owned_namespace, delete_owned_namespace, ensure_absent_or_owned, ManifestUnit};
use crate::unit::{render, DeploymentUnit, InstallContext};

pub const ID: &str = "tekton";
pub const STAGING_NAMESPACE: &str = "tekton-staging";
const STAGING_MANIFEST: &str = "tekton-staging.yaml";

const BASE: ManifestUnit = ManifestUnit {
    id: ID,
    title: "Tekton pipelines",
    version: "0.23.0",
    namespace: "tekton-pipelines",
    manifest: "tekton.yaml",
    selectors: &["app=tekton-pipelines-controller", "app=tekton-pipelines-webhook"],
    needs_domain: false,
    upgradable: true,
    ingress_service: None,
    vars: &[],
};

pub struct Tekton;

impl Tekton {
    fn staging_yaml(ctx: &InstallContext) -> KilnResult<String> {
        let mut vars = BTreeMap::from([("namespace", STAGING_NAMESPACE.to_string())]);
        if let Some(d) = ctx.system_domain.as_deref() {
            vars.insert("system_domain", d.to_string());
        }
        Ok(render(&ctx.manifests.load(STAGING_MANIFEST)?, &vars))
    }

    async fn apply_staging(&self, cluster: &dyn ClusterOps, ctx: &InstallContext) -> KilnResult<()> {
        let yaml = Self::staging_yaml(ctx)?;
        if !ensure_absent_or_owned(cluster, STAGING_NAMESPACE).await? {
            create_owned_namespace(cluster, STAGING_NAMESPACE, &[]).await?;
        }
        let n = cluster.apply_manifest(&yaml, None).await?;
        info!(ns = STAGING_NAMESPACE, objects = n, "staging pipeline applied");
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeploymentUnit for Tekton {
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
        ensure_absent_or_owned(cluster, STAGING_NAMESPACE).await?;
        BASE.install(cluster, ctx, &BTreeMap::new()).await?;
        self.apply_staging(cluster, ctx).await
    }

    async fn upgrade(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, _options: ScopedOptions<'_>) -> KilnResult<()> {
        ensure_absent_or_owned(cluster, STAGING_NAMESPACE).await?;
        BASE.reapply(cluster, ctx, &BTreeMap::new()).await?;
        self.apply_staging(cluster, ctx).await
    }

    async fn delete(&self, cluster: &dyn ClusterOps, ctx: &InstallContext) -> KilnResult<()> {
        if !delete_owned_namespace(cluster, ctx, BASE.namespace).await? {
            return Ok(());
        }
        delete_owned_namespace(cluster, ctx, STAGING_NAMESPACE).await.map(|_| ())
    }

    async fn backup(&self, _cluster: &dyn ClusterOps, _ctx: &InstallContext, _dir: &Path) -> KilnResult<()> {
        Ok(())
    }

    async fn restore(&self, _cluster: &dyn ClusterOps, _ctx: &InstallContext, _dir: &Path) -> KilnResult<()> {
        Ok(())
    }
}
