//! Platform detection from node metadata.

use std::fmt;

use k8s_openapi::api::core::v1::Node;
use kiln_core::KilnResult;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ClusterOps;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Kind,
    K3s,
    Ibm,
    Minikube,
    Generic,
}

/// Detection order. Generic is the fallback and never probed.
pub const PRIORITY: [Platform; 4] = [Platform::Kind, Platform::K3s, Platform::Ibm, Platform::Minikube];

/// Facts cached once a platform is picked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub platform: Platform,
    pub external_ips: Vec<String>,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Kind => "kind",
            Platform::K3s => "k3s",
            Platform::Ibm => "ibm",
            Platform::Minikube => "minikube",
            Platform::Generic => "generic",
        };
        f.write_str(s)
    }
}

impl Platform {
    /// Does this platform describe the cluster these nodes belong to. Pure.
    pub fn detect(&self, nodes: &[Node]) -> bool {
        match self {
            Platform::Kind => nodes.iter().any(|n| {
                let provider = n.spec.as_ref().and_then(|s| s.provider_id.as_deref()).unwrap_or("");
                let name = n.metadata.name.as_deref().unwrap_or("");
                let kindest_image = n
                    .status
                    .as_ref()
                    .and_then(|s| s.images.as_ref())
                    .map(|imgs| imgs.iter().flat_map(|i| i.names.iter().flatten()).any(|nm| nm.contains("kindest")))
                    .unwrap_or(false);
                provider.starts_with("kind://") || (name.ends_with("-control-plane") && kindest_image)
            }),
            Platform::K3s => nodes.iter().any(|n| {
                n.status
                    .as_ref()
                    .and_then(|s| s.node_info.as_ref())
                    .map(|i| i.kubelet_version.contains("+k3s"))
                    .unwrap_or(false)
            }),
            Platform::Ibm => nodes.iter().any(|n| {
                n.metadata
                    .labels
                    .as_ref()
                    .map(|l| l.keys().any(|k| k.starts_with("ibm-cloud.kubernetes.io/")))
                    .unwrap_or(false)
            }),
            Platform::Minikube => nodes.iter().any(|n| {
                n.metadata.labels.as_ref().map(|l| l.contains_key("minikube.k8s.io/name")).unwrap_or(false)
            }),
            Platform::Generic => true,
        }
    }

    /// Address type that is reachable from outside the cluster on this platform.
    fn address_type(&self) -> &'static str {
        match self {
            Platform::Kind | Platform::K3s | Platform::Minikube => "InternalIP",
            Platform::Ibm | Platform::Generic => "ExternalIP",
        }
    }

    /// Collect platform facts from already fetched nodes. Read-only.
    pub fn load_from(&self, nodes: &[Node]) -> PlatformInfo {
        let want = self.address_type();
        let mut external_ips: Vec<String> = nodes
            .iter()
            .filter_map(|n| n.status.as_ref().and_then(|s| s.addresses.as_ref()))
            .flatten()
            .filter(|a| a.type_ == want)
            .map(|a| a.address.clone())
            .collect();
        external_ips.sort();
        external_ips.dedup();
        PlatformInfo { platform: *self, external_ips }
    }

    /// Fetch the nodes and collect this platform's facts, without detection.
    pub async fn load(&self, cluster: &dyn ClusterOps) -> KilnResult<PlatformInfo> {
        let nodes = cluster.list_nodes().await?;
        Ok(self.load_from(&nodes))
    }
}

/// First platform in [`PRIORITY`] whose detector matches, else Generic.
pub fn detect(nodes: &[Node]) -> Platform {
    PRIORITY.iter().copied().find(|p| p.detect(nodes)).unwrap_or(Platform::Generic)
}

/// Fetch nodes once, pick the platform, load its facts.
pub async fn resolve(cluster: &dyn ClusterOps) -> KilnResult<PlatformInfo> {
    let nodes = cluster.list_nodes().await?;
    let platform = detect(&nodes);
    let info = platform.load_from(&nodes);
    info!(platform = %info.platform, ips = ?info.external_ips, "platform detected");
    Ok(info)
}
