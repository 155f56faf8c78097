//! Kiln kubehub: the cluster handle every deployment unit talks through.
//!
//! [`ClusterOps`] is the seam. [`KubeCluster`] backs it with kube-rs and [`fake::FakeCluster`] with
//! in-memory state for tests. Calls never retry; waiting lives in [`wait`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::{
    batch::v1::Job,
    core::v1::{Namespace, Node, Pod, Secret, Service, ServiceAccount},
    networking::v1::Ingress,
};
use kiln_core::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};

mod cluster;
pub mod fake;
pub mod platform;
pub mod wait;

pub use cluster::KubeCluster;
pub use platform::{Platform, PlatformInfo};

/// Captured output of a remote command, surrounding whitespace trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Coordinates of a custom resource kind that is created without a typed client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomResource {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl CustomResource {
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &str) -> KilnResult<Vec<Pod>>;
    async fn get_pod(&self, namespace: &str, name: &str) -> KilnResult<Pod>;
    async fn list_ingresses(&self, namespace: &str, selector: &str) -> KilnResult<Vec<Ingress>>;
    /// Services across all namespaces (`None`) or one, filtered by a field selector.
    async fn list_services(&self, namespace: Option<&str>, field_selector: &str) -> KilnResult<Vec<Service>>;
    async fn list_nodes(&self) -> KilnResult<Vec<Node>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> KilnResult<Secret>;
    async fn create_secret(&self, namespace: &str, secret: Secret) -> KilnResult<()>;
    async fn create_service_account(&self, namespace: &str, account: ServiceAccount) -> KilnResult<()>;

    async fn get_namespace(&self, name: &str) -> KilnResult<Option<Namespace>>;
    async fn create_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> KilnResult<()>;
    async fn namespace_exists_and_owned(&self, name: &str) -> KilnResult<bool>;
    async fn label_namespace(&self, name: &str, key: &str, value: &str) -> KilnResult<()>;
    /// Refuses with `NotOwned`, touching nothing, when the ownership label is absent.
    async fn delete_namespace(&self, name: &str) -> KilnResult<()>;

    async fn create_job(&self, namespace: &str, job: Job) -> KilnResult<()>;
    async fn get_job(&self, namespace: &str, name: &str) -> KilnResult<Job>;

    /// Run `sh -c command` in the pod, optionally feeding `stdin`.
    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: &str,
        stdin: Option<&str>,
    ) -> KilnResult<ExecOutput>;
    async fn server_version(&self) -> KilnResult<String>;

    async fn apply_manifest(&self, yaml: &str, namespace: Option<&str>) -> KilnResult<usize>;
    async fn delete_manifest(&self, yaml: &str, namespace: Option<&str>) -> KilnResult<usize>;
    async fn create_custom(&self, resource: &CustomResource, namespace: &str, object: serde_json::Value) -> KilnResult<()>;

    /// Detected platform. Resolved at most once per handle.
    async fn platform(&self) -> KilnResult<PlatformInfo>;
}

/// Map a kube error onto the Kiln error kinds by HTTP status.
pub(crate) fn kube_err(e: kube::Error, what: impl std::fmt::Display) -> KilnError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => KilnError::NotFound(format!("{}: {}", what, ae.message)),
        kube::Error::Api(ae) if ae.code == 409 => KilnError::AlreadyExists(format!("{}: {}", what, ae.message)),
        other => KilnError::remote(format!("{}: {}", what, other)),
    }
}

/// Equality-based label selector match (`k=v,k2=v2`, bare `k` means "present").
pub fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector.split(',').map(str::trim).filter(|s| !s.is_empty()).all(|term| {
        let labels = match labels {
            Some(l) => l,
            None => return false,
        };
        match term.split_once("!=") {
            Some((k, v)) => labels.get(k.trim()).map(|x| x != v.trim()).unwrap_or(true),
            None => match term.split_once('=') {
                Some((k, v)) => {
                    let v = v.trim_start_matches('=');
                    labels.get(k.trim()).map(|x| x == v.trim()).unwrap_or(false)
                }
                None => labels.contains_key(term),
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn selector_equality_and_presence() {
        let l = labels(&[("name", "app-ingress"), ("tier", "edge")]);
        assert!(selector_matches("name=app-ingress", Some(&l)));
        assert!(selector_matches("name==app-ingress, tier", Some(&l)));
        assert!(!selector_matches("name=other", Some(&l)));
        assert!(selector_matches("tier!=core", Some(&l)));
        assert!(!selector_matches("missing", Some(&l)));
        assert!(selector_matches("", None));
        assert!(!selector_matches("name=x", None));
    }

    #[test]
    fn custom_resource_api_version() {
        let cr = CustomResource { group: "tekton.dev", version: "v1beta1", kind: "PipelineRun", plural: "pipelineruns" };
        assert_eq!(cr.api_version(), "tekton.dev/v1beta1");
    }
}
