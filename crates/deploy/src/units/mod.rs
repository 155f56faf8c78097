//! The fixed set of platform subsystems, in install order.

use std::path::Path;

use kiln_core::{KilnResult, ScopedOptions};
use kiln_kubehub::ClusterOps;

use crate::common::ManifestUnit;
use crate::unit::{DeploymentUnit, InstallContext};

mod cert_manager;
mod gitea;
mod tekton;
mod workloads;

pub use cert_manager::CertManager;
pub use gitea::{Gitea, GiteaConfig};
pub use tekton::Tekton;
pub use workloads::{Workloads, WorkloadsConfig};

pub const TRAEFIK: ManifestUnit = ManifestUnit {
    id: "traefik",
    title: "Traefik ingress controller",
    version: "2.4.8",
    namespace: "traefik",
    manifest: "traefik.yaml",
    selectors: &["app.kubernetes.io/name=traefik"],
    needs_domain: false,
    upgradable: true,
    ingress_service: Some("traefik"),
    vars: &[],
};

pub const KILN: ManifestUnit = ManifestUnit {
    id: "kiln",
    title: "Kiln API server",
    version: "0.1.0",
    namespace: "kiln",
    manifest: "kiln.yaml",
    selectors: &["app.kubernetes.io/name=kiln-server"],
    needs_domain: true,
    upgradable: false,
    ingress_service: None,
    vars: &[],
};

pub const QUARKS: ManifestUnit = ManifestUnit {
    id: "quarks",
    title: "Quarks secret generator",
    version: "1.0.760",
    namespace: "quarks",
    manifest: "quarks.yaml",
    selectors: &["name=quarks-secret"],
    needs_domain: false,
    upgradable: false,
    ingress_service: None,
    vars: &[],
};

/// Node port the in-cluster registry listens on.
pub const REGISTRY_NODE_PORT: &str = "30500";

pub const REGISTRY: ManifestUnit = ManifestUnit {
    id: "registry",
    title: "Container registry",
    version: "0.1.0",
    namespace: "kiln-registry",
    manifest: "registry.yaml",
    selectors: &["app.kubernetes.io/name=registry"],
    needs_domain: false,
    upgradable: false,
    ingress_service: None,
    vars: &[("node_port", REGISTRY_NODE_PORT)],
};

pub const SERVICE_CATALOG: ManifestUnit = ManifestUnit {
    id: "service-catalog",
    title: "Service catalog",
    version: "0.3.1",
    namespace: "service-catalog",
    manifest: "service-catalog.yaml",
    selectors: &["app=catalog-catalog-controller-manager"],
    needs_domain: false,
    upgradable: false,
    ingress_service: None,
    vars: &[],
};

/// Closed set of units Kiln knows how to install.
pub enum Unit {
    Traefik(ManifestUnit),
    Kiln(ManifestUnit),
    Quarks(ManifestUnit),
    Workloads(Workloads),
    Gitea(Gitea),
    Registry(ManifestUnit),
    Tekton(Tekton),
    ServiceCatalog(ManifestUnit),
    CertManager(CertManager),
}

impl Unit {
    fn inner(&self) -> &dyn DeploymentUnit {
        match self {
            Unit::Traefik(u) | Unit::Kiln(u) | Unit::Quarks(u) | Unit::Registry(u) | Unit::ServiceCatalog(u) => u,
            Unit::Workloads(u) => u,
            Unit::Gitea(u) => u,
            Unit::Tekton(u) => u,
            Unit::CertManager(u) => u,
        }
    }
}

/// Install order. Uninstall walks it backwards.
pub fn standard_units() -> Vec<Unit> {
    vec![
        Unit::Traefik(TRAEFIK),
        Unit::Kiln(KILN),
        Unit::Quarks(QUARKS),
        Unit::Workloads(Workloads),
        Unit::Gitea(Gitea),
        Unit::Registry(REGISTRY),
        Unit::Tekton(Tekton),
        Unit::ServiceCatalog(SERVICE_CATALOG),
        Unit::CertManager(CertManager),
    ]
}

#[async_trait::async_trait]
impl DeploymentUnit for Unit {
    fn id(&self) -> &str {
        self.inner().id()
    }

    fn describe(&self) -> String {
        self.inner().describe()
    }

    fn version(&self) -> &str {
        self.inner().version()
    }

    fn ingress_service(&self) -> Option<&str> {
        self.inner().ingress_service()
    }

    async fn deploy(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, options: ScopedOptions<'_>) -> KilnResult<()> {
        self.inner().deploy(cluster, ctx, options).await
    }

    async fn upgrade(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, options: ScopedOptions<'_>) -> KilnResult<()> {
        self.inner().upgrade(cluster, ctx, options).await
    }

    async fn delete(&self, cluster: &dyn ClusterOps, ctx: &InstallContext) -> KilnResult<()> {
        self.inner().delete(cluster, ctx).await
    }

    async fn backup(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, dir: &Path) -> KilnResult<()> {
        self.inner().backup(cluster, ctx, dir).await
    }

    async fn restore(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, dir: &Path) -> KilnResult<()> {
        self.inner().restore(cluster, ctx, dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_ingress_comes_first() {
        let units = standard_units();
        let ids: HashSet<&str> = units.iter().map(|u| u.id()).collect();
        assert_eq!(ids.len(), units.len());
        assert_eq!(units[0].ingress_service(), Some("traefik"));
        assert!(units[1..].iter().all(|u| u.ingress_service().is_none()));
    }
}
