//! Namespace where user applications run, plus the app-ingress controller they are routed through.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, LocalObjectReference, PodSpec, PodTemplateSpec, Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kiln_core::{InstallationOption, KilnResult, ScopedOptions, OWNERSHIP_LABEL_KEY, OWNERSHIP_LABEL_VALUE};
use kiln_kubehub::{wait, ClusterOps};
use tracing::info;

use crate::common::{create_owned_namespace, delete_owned_namespace, ensure_absent, ensure_absent_or_owned};
use crate::unit::{render, DeploymentUnit, InstallContext};

pub const ID: &str = "workloads";
pub const NAMESPACE: &str = "kiln-workloads";
const VERSION: &str = "0.1";
const APP_INGRESS_NAMESPACE: &str = "app-ingress";
const APP_INGRESS_MANIFEST: &str = "app-ingress.yaml";
const APP_INGRESS_SELECTOR: &str = "name=app-ingress";
const WARMUP_JOB: &str = "buildpack-builder-warmup";
pub const REGISTRY_CREDS: &str = "registry-creds";
pub const GIT_CREDS: &str = "gitea-creds";

/// Typed view of the `workloads.*` options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadsConfig {
    pub builder_image: String,
    pub warmup: bool,
    pub registry_host: String,
    pub registry_username: String,
    pub registry_password: String,
    pub git_url: String,
    pub git_username: String,
    pub git_password: String,
}

impl WorkloadsConfig {
    pub fn from_options(o: &ScopedOptions<'_>) -> KilnResult<Self> {
        Ok(Self {
            builder_image: o.get_string("builder_image")?,
            warmup: o.get_bool("warmup")?,
            registry_host: o.get_string("registry_host")?,
            registry_username: o.get_string("registry_username")?,
            registry_password: o.get_string("registry_password")?,
            git_url: o.get_string("git_url")?,
            git_username: o.get_string("git_username")?,
            git_password: o.get_string("git_password")?,
        })
    }

    fn docker_config(&self) -> String {
        let creds = serde_json::json!({ "username": self.registry_username, "password": self.registry_password });
        let mut auths = serde_json::Map::new();
        auths.insert(format!("127.0.0.1:{}", super::REGISTRY_NODE_PORT), creds.clone());
        auths.insert(self.registry_host.clone(), creds);
        serde_json::json!({ "auths": auths }).to_string()
    }
}

pub struct Workloads;

impl Workloads {
    pub fn options() -> Vec<InstallationOption> {
        vec![
            InstallationOption::string("workloads.builder_image", "Buildpack builder image")
                .with_default("paketobuildpacks/builder:full"),
            InstallationOption::bool("workloads.warmup", "Pre-pull the builder image during install").with_default(true),
            InstallationOption::string("workloads.registry_host", "Registry host pods pull from")
                .with_default("registry.kiln-registry"),
            InstallationOption::string("workloads.registry_username", "Registry user").with_default("admin"),
            InstallationOption::string("workloads.registry_password", "Registry password").with_default("password"),
            InstallationOption::string("workloads.git_url", "Git server pipelines clone from")
                .with_default("http://gitea-http.gitea:10080"),
            InstallationOption::string("workloads.git_username", "Git user").with_default("dev"),
            InstallationOption::string("workloads.git_password", "Git password").with_default("changeme"),
        ]
    }

    fn secret(name: &str, type_: &str, data: BTreeMap<String, String>, annotations: BTreeMap<String, String>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: if annotations.is_empty() { None } else { Some(annotations) },
                ..Default::default()
            },
            string_data: Some(data),
            type_: Some(type_.to_string()),
            ..Default::default()
        }
    }

    async fn create_credentials(&self, cluster: &dyn ClusterOps, cfg: &WorkloadsConfig) -> KilnResult<()> {
        let git = Self::secret(
            GIT_CREDS,
            "kubernetes.io/basic-auth",
            BTreeMap::from([
                ("username".to_string(), cfg.git_username.clone()),
                ("password".to_string(), cfg.git_password.clone()),
            ]),
            BTreeMap::from([("tekton.dev/git-0".to_string(), cfg.git_url.clone())]),
        );
        cluster.create_secret(NAMESPACE, git).await?;
        let registry = Self::secret(
            REGISTRY_CREDS,
            "kubernetes.io/dockerconfigjson",
            BTreeMap::from([(".dockerconfigjson".to_string(), cfg.docker_config())]),
            BTreeMap::new(),
        );
        cluster.create_secret(NAMESPACE, registry).await?;

        // pods using this account inherit the pull secrets
        let account = ServiceAccount {
            metadata: ObjectMeta { name: Some(NAMESPACE.to_string()), ..Default::default() },
            image_pull_secrets: Some(vec![
                LocalObjectReference { name: Some(REGISTRY_CREDS.to_string()) },
                LocalObjectReference { name: Some(GIT_CREDS.to_string()) },
            ]),
            automount_service_account_token: Some(false),
            ..Default::default()
        };
        cluster.create_service_account(NAMESPACE, account).await
    }

    fn warmup_job(image: &str) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(WARMUP_JOB.to_string()),
                labels: Some(BTreeMap::from([(OWNERSHIP_LABEL_KEY.to_string(), OWNERSHIP_LABEL_VALUE.to_string())])),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(1),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "warmup".to_string(),
                            image: Some(image.to_string()),
                            command: Some(vec!["/bin/ls".to_string()]),
                            ..Default::default()
                        }],
                        restart_policy: Some("Never".to_string()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn app_ingress_yaml(ctx: &InstallContext) -> KilnResult<String> {
        let vars = BTreeMap::from([("namespace", APP_INGRESS_NAMESPACE.to_string())]);
        Ok(render(&ctx.manifests.load(APP_INGRESS_MANIFEST)?, &vars))
    }
}

#[async_trait::async_trait]
impl DeploymentUnit for Workloads {
    fn id(&self) -> &str {
        ID
    }

    fn describe(&self) -> String {
        format!("Workloads namespace and app ingress ({}) version {}", ID, VERSION)
    }

    fn version(&self) -> &str {
        VERSION
    }

    async fn deploy(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, options: ScopedOptions<'_>) -> KilnResult<()> {
        ensure_absent(cluster, ID, NAMESPACE).await?;
        ensure_absent_or_owned(cluster, APP_INGRESS_NAMESPACE).await?;
        let cfg = WorkloadsConfig::from_options(&options)?;
        let ingress_yaml = Self::app_ingress_yaml(ctx)?;
        info!(unit = ID, ns = NAMESPACE, "deploying");

        create_owned_namespace(cluster, NAMESPACE, &[("quarks.cloudfoundry.org/monitored", "quarks-secret")]).await?;
        self.create_credentials(cluster, &cfg).await?;

        cluster.apply_manifest(&ingress_yaml, None).await?;
        cluster.label_namespace(APP_INGRESS_NAMESPACE, OWNERSHIP_LABEL_KEY, OWNERSHIP_LABEL_VALUE).await?;
        let t = &ctx.timeouts;
        wait::wait_until_pod_by_selector_exists(cluster, APP_INGRESS_NAMESPACE, APP_INGRESS_SELECTOR, t.poll_interval, t.deployment)
            .await?;

        if cfg.warmup {
            info!(image = %cfg.builder_image, "warming up builder image");
            cluster.create_job(NAMESPACE, Self::warmup_job(&cfg.builder_image)).await?;
            wait::wait_for_job_completed(cluster, NAMESPACE, WARMUP_JOB, t.poll_interval, t.warmup_job).await?;
        }
        info!(unit = ID, "deployed");
        Ok(())
    }

    async fn upgrade(&self, _cluster: &dyn ClusterOps, _ctx: &InstallContext, _options: ScopedOptions<'_>) -> KilnResult<()> {
        info!(unit = ID, "no upgrade steps");
        Ok(())
    }

    async fn delete(&self, cluster: &dyn ClusterOps, ctx: &InstallContext) -> KilnResult<()> {
        if !delete_owned_namespace(cluster, ctx, NAMESPACE).await? {
            return Ok(());
        }
        if !cluster.namespace_exists_and_owned(APP_INGRESS_NAMESPACE).await? {
            info!(ns = APP_INGRESS_NAMESPACE, "namespace missing or not owned by kiln; skipping");
            return Ok(());
        }
        let yaml = Self::app_ingress_yaml(ctx)?;
        cluster.delete_manifest(&yaml, None).await?;
        let t = &ctx.timeouts;
        wait::wait_for_namespace_gone(cluster, APP_INGRESS_NAMESPACE, t.poll_interval, t.deployment).await
    }

    async fn backup(&self, _cluster: &dyn ClusterOps, _ctx: &InstallContext, _dir: &Path) -> KilnResult<()> {
        Ok(())
    }

    async fn restore(&self, _cluster: &dyn ClusterOps, _ctx: &InstallContext, _dir: &Path) -> KilnResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{DefaultSource, OptionSet, OptionSource};

    #[test]
    fn config_reads_scoped_defaults() {
        let mut defaults = DefaultSource::new();
        let mut set = OptionSet::from_options(Workloads::options())
            .unwrap()
            .populate([&mut defaults as &mut dyn OptionSource])
            .unwrap();
        let cfg = WorkloadsConfig::from_options(&set.for_deployment(ID)).unwrap();
        assert!(cfg.warmup);
        assert_eq!(cfg.git_username, "dev");
        let docker: serde_json::Value = serde_json::from_str(&cfg.docker_config()).unwrap();
        assert_eq!(docker.pointer("/auths/registry.kiln-registry/username").and_then(|v| v.as_str()), Some("admin"));
        assert!(docker.pointer("/auths/127.0.0.1:30500").is_some());
    }

    #[test]
    fn warmup_job_never_restarts() {
        let job = Workloads::warmup_job("builder:x");
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(1));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.containers[0].image.as_deref(), Some("builder:x"));
    }
}
