//! Kiln stage: start a build pipeline run for an application and request its TLS certificate.
//!
//! Each call creates a fresh, uniquely named pipeline run. Certificates are keyed by the
//! application name, so a repeated stage of the same application reuses the existing request.

#![forbid(unsafe_code)]

use std::time::Instant;

use kiln_core::{KilnError, KilnResult, OptionOrigin, OWNERSHIP_LABEL_KEY, OWNERSHIP_LABEL_VALUE};
use kiln_kubehub::{ClusterOps, CustomResource};
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

pub const PIPELINE_RUN: CustomResource =
    CustomResource { group: "tekton.dev", version: "v1beta1", kind: "PipelineRun", plural: "pipelineruns" };
pub const CERTIFICATE: CustomResource =
    CustomResource { group: "cert-manager.io", version: "v1", kind: "Certificate", plural: "certificates" };
pub const QUARKS_SECRET: CustomResource = CustomResource {
    group: "quarks.cloudfoundry.org",
    version: "v1alpha1",
    kind: "QuarksSecret",
    plural: "quarkssecrets",
};

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

/// Where staging resources go and what they point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    pub staging_namespace: String,
    pub service_account: String,
    pub pipeline: String,
    pub git_url: String,
    pub registry_url: String,
    pub system_domain: String,
    /// `Computed` when the domain was derived from the ingress address.
    pub domain_origin: OptionOrigin,
    pub cluster_issuer: String,
}

impl StageConfig {
    pub fn new(system_domain: impl Into<String>) -> Self {
        Self {
            staging_namespace: "tekton-staging".to_string(),
            service_account: "staging-triggers-admin".to_string(),
            pipeline: "staging-pipeline".to_string(),
            git_url: "http://gitea-http.gitea:10080".to_string(),
            registry_url: "registry.kiln-registry/apps".to_string(),
            system_domain: system_domain.into(),
            domain_origin: OptionOrigin::Flag,
            cluster_issuer: "letsencrypt-production".to_string(),
        }
    }

    pub fn with_domain_origin(mut self, origin: OptionOrigin) -> Self {
        self.domain_origin = origin;
        self
    }
}

/// The application to stage: `org/name` at `revision`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRef {
    pub org: String,
    pub name: String,
    pub revision: String,
}

impl AppRef {
    pub fn new(org: impl Into<String>, name: impl Into<String>, revision: impl Into<String>) -> Self {
        Self { org: org.into(), name: name.into(), revision: revision.into() }
    }

    pub fn validate(&self) -> KilnResult<()> {
        for (what, v) in [("org", &self.org), ("app name", &self.name)] {
            if v.len() > 63 || !DNS_LABEL.is_match(v) {
                return Err(KilnError::validation(format!("{} '{}' is not a DNS-1123 label", what, v)));
            }
        }
        if self.revision.trim().is_empty() {
            return Err(KilnError::validation("revision must not be empty"));
        }
        Ok(())
    }

    pub fn git_url(&self, base: &str) -> String {
        format!("{}/{}/{}", base.trim_end_matches('/'), self.org, self.name)
    }

    pub fn image_url(&self, registry: &str) -> String {
        format!("{}/{}:{}", registry.trim_end_matches('/'), self.name, self.revision)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateOutcome {
    Created,
    /// A request for this application existed already.
    Reused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    pub pipeline_run: String,
    pub certificate: CertificateOutcome,
}

/// 16 hex chars: 64-bit FNV-1a over 16 random bytes.
pub fn run_id() -> String {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in uuid::Uuid::new_v4().as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{:016x}", h)
}

pub struct Stager<'c> {
    cluster: &'c dyn ClusterOps,
    cfg: StageConfig,
}

impl<'c> Stager<'c> {
    pub fn new(cluster: &'c dyn ClusterOps, cfg: StageConfig) -> Self {
        Self { cluster, cfg }
    }

    pub fn pipeline_run(&self, app: &AppRef, id: &str) -> Value {
        json!({
            "apiVersion": PIPELINE_RUN.api_version(),
            "kind": PIPELINE_RUN.kind,
            "metadata": {
                "name": format!("{}{}", app.name, id),
                "labels": {
                    "app.kubernetes.io/name": app.name,
                    "app.kubernetes.io/part-of": app.org,
                    OWNERSHIP_LABEL_KEY: OWNERSHIP_LABEL_VALUE,
                    "app.kubernetes.io/component": "staging",
                }
            },
            "spec": {
                "serviceAccountName": self.cfg.service_account,
                "pipelineRef": { "name": self.cfg.pipeline },
                "workspaces": [{
                    "name": "source",
                    "volumeClaimTemplate": {
                        "spec": {
                            "accessModes": ["ReadWriteOnce"],
                            "resources": { "requests": { "storage": "1Gi" } }
                        }
                    }
                }],
                "resources": [
                    {
                        "name": "source-repo",
                        "resourceSpec": {
                            "type": "git",
                            "params": [
                                { "name": "revision", "value": app.revision },
                                { "name": "url", "value": app.git_url(&self.cfg.git_url) }
                            ]
                        }
                    },
                    {
                        "name": "image",
                        "resourceSpec": {
                            "type": "image",
                            "params": [{ "name": "url", "value": app.image_url(&self.cfg.registry_url) }]
                        }
                    }
                ]
            }
        })
    }

    /// Local-signer request when Kiln derived the domain itself, cluster issuer otherwise.
    pub fn certificate(&self, app: &AppRef) -> (&'static CustomResource, Value) {
        let host = format!("{}.{}", app.name, self.cfg.system_domain);
        let secret = format!("{}-tls", app.name);
        if self.cfg.domain_origin == OptionOrigin::Computed {
            let obj = json!({
                "apiVersion": QUARKS_SECRET.api_version(),
                "kind": QUARKS_SECRET.kind,
                "metadata": { "name": app.name, "namespace": app.org },
                "spec": {
                    "request": {
                        "certificate": {
                            "CAKeyRef": { "key": "private_key", "name": "ca-cert" },
                            "CARef": { "key": "certificate", "name": "ca-cert" },
                            "commonName": host,
                            "isCA": false,
                            "alternativeNames": [host],
                            "signerType": "local"
                        }
                    },
                    "secretName": secret,
                    "type": "tls"
                }
            });
            (&QUARKS_SECRET, obj)
        } else {
            let obj = json!({
                "apiVersion": CERTIFICATE.api_version(),
                "kind": CERTIFICATE.kind,
                "metadata": { "name": app.name, "namespace": app.org },
                "spec": {
                    "commonName": host,
                    "secretName": secret,
                    "dnsNames": [host],
                    "issuerRef": { "name": self.cfg.cluster_issuer, "kind": "ClusterIssuer" }
                }
            });
            (&CERTIFICATE, obj)
        }
    }

    /// Create a pipeline run for `app`, then make sure its certificate is requested.
    pub async fn stage(&self, app: &AppRef) -> KilnResult<StageOutcome> {
        app.validate()?;
        if self.cfg.system_domain.is_empty() {
            return Err(KilnError::validation("staging needs a system domain"));
        }
        let t0 = Instant::now();
        let id = run_id();
        let run = self.pipeline_run(app, &id);
        let run_name = format!("{}{}", app.name, id);
        self.cluster.create_custom(&PIPELINE_RUN, &self.cfg.staging_namespace, run).await?;
        info!(org = %app.org, app = %app.name, run = %run_name, "pipeline run created");

        let (resource, cert) = self.certificate(app);
        let certificate = match self.cluster.create_custom(resource, &app.org, cert).await {
            Ok(()) => CertificateOutcome::Created,
            Err(e) if e.is_already_exists() => {
                debug!(app = %app.name, kind = resource.kind, "certificate requested earlier");
                CertificateOutcome::Reused
            }
            Err(e) => return Err(e),
        };
        counter!("stage_ok", 1u64);
        histogram!("stage_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(StageOutcome { pipeline_run: run_name, certificate })
    }
}
