//! Git server the staging pipelines clone from. Its admin credentials survive backup/restore.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kiln_core::{InstallationOption, KilnError, KilnResult, ScopedOptions};
use kiln_kubehub::ClusterOps;
use tracing::{info, warn};

use crate::common::{delete_owned_namespace, ManifestUnit};
use crate::unit::{DeploymentUnit, InstallContext};

pub const ID: &str = "gitea";
const ADMIN_SECRET: &str = "gitea-admin";
const BACKUP_FILE: &str = "gitea-admin.json";

const BASE: ManifestUnit = ManifestUnit {
    id: ID,
    title: "Gitea",
    version: "1.13.7",
    namespace: "gitea",
    manifest: "gitea.yaml",
    selectors: &["app.kubernetes.io/name=gitea"],
    needs_domain: true,
    upgradable: false,
    ingress_service: None,
    vars: &[],
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiteaConfig {
    pub admin_username: String,
    pub admin_password: String,
}

impl GiteaConfig {
    pub fn from_options(o: &ScopedOptions<'_>) -> KilnResult<Self> {
        let cfg = Self { admin_username: o.get_string("admin_username")?, admin_password: o.get_string("admin_password")? };
        if cfg.admin_username.is_empty() || cfg.admin_password.is_empty() {
            return Err(KilnError::validation("gitea admin credentials must not be empty"));
        }
        Ok(cfg)
    }
}

pub struct Gitea;

impl Gitea {
    pub fn options() -> Vec<InstallationOption> {
        vec![
            InstallationOption::string("gitea.admin_username", "Gitea admin user").with_default("dev"),
            InstallationOption::string("gitea.admin_password", "Gitea admin password").with_default("changeme"),
        ]
    }

    fn admin_secret(cfg: &GiteaConfig) -> Secret {
        Secret {
            metadata: ObjectMeta { name: Some(ADMIN_SECRET.to_string()), ..Default::default() },
            string_data: Some(BTreeMap::from([
                ("username".to_string(), cfg.admin_username.clone()),
                ("password".to_string(), cfg.admin_password.clone()),
            ])),
            type_: Some("kubernetes.io/basic-auth".to_string()),
            ..Default::default()
        }
    }

    /// Keep what recreates the secret, drop server-populated metadata.
    fn portable(secret: Secret) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: secret.metadata.name,
                labels: secret.metadata.labels,
                annotations: secret.metadata.annotations,
                ..Default::default()
            },
            data: secret.data,
            string_data: secret.string_data,
            type_: secret.type_,
            immutable: secret.immutable,
        }
    }
}

#[async_trait::async_trait]
impl DeploymentUnit for Gitea {
    fn id(&self) -> &str {
        ID
    }

    fn describe(&self) -> String {
        BASE.summary()
    }

    fn version(&self) -> &str {
        BASE.version
    }

    async fn deploy(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, options: ScopedOptions<'_>) -> KilnResult<()> {
        let cfg = GiteaConfig::from_options(&options)?;
        let extra = BTreeMap::from([("admin_username", cfg.admin_username.clone()), ("admin_secret", ADMIN_SECRET.to_string())]);
        let yaml = BASE.prepare(cluster, ctx, &extra).await?;
        // the server pod mounts the admin secret and cannot start without it
        cluster.create_secret(BASE.namespace, Self::admin_secret(&cfg)).await?;
        BASE.apply(cluster, ctx, &yaml).await
    }

    async fn upgrade(&self, _cluster: &dyn ClusterOps, _ctx: &InstallContext, _options: ScopedOptions<'_>) -> KilnResult<()> {
        info!(unit = ID, "no upgrade steps");
        Ok(())
    }

    async fn delete(&self, cluster: &dyn ClusterOps, ctx: &InstallContext) -> KilnResult<()> {
        delete_owned_namespace(cluster, ctx, BASE.namespace).await.map(|_| ())
    }

    async fn backup(&self, cluster: &dyn ClusterOps, _ctx: &InstallContext, dir: &Path) -> KilnResult<()> {
        let secret = match cluster.get_secret(BASE.namespace, ADMIN_SECRET).await {
            Ok(s) => s,
            Err(KilnError::NotFound(_)) => {
                warn!(unit = ID, "admin secret not found; nothing to back up");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let path = dir.join(BACKUP_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(&Self::portable(secret))?)?;
        info!(unit = ID, path = %path.display(), "backed up admin secret");
        Ok(())
    }

    async fn restore(&self, cluster: &dyn ClusterOps, _ctx: &InstallContext, dir: &Path) -> KilnResult<()> {
        let path = dir.join(BACKUP_FILE);
        if !path.exists() {
            info!(unit = ID, "no backup present; skipping");
            return Ok(());
        }
        let secret: Secret = serde_json::from_slice(&std::fs::read(&path)?)?;
        match cluster.create_secret(BASE.namespace, Self::portable(secret)).await {
            Ok(()) => {
                info!(unit = ID, "restored admin secret");
                Ok(())
            }
            Err(KilnError::AlreadyExists(_)) => {
                info!(unit = ID, "admin secret already present; left untouched");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portable_drops_server_fields() {
        let mut s = Gitea::admin_secret(&GiteaConfig { admin_username: "a".into(), admin_password: "b".into() });
        s.metadata.resource_version = Some("42".into());
        s.metadata.uid = Some("0000".into());
        let p = Gitea::portable(s);
        assert!(p.metadata.resource_version.is_none());
        assert!(p.metadata.uid.is_none());
        assert_eq!(p.metadata.name.as_deref(), Some(ADMIN_SECRET));
        assert_eq!(p.type_.as_deref(), Some("kubernetes.io/basic-auth"));
    }
}
