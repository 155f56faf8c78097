#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kiln_core::{DefaultSource, FlagSource, OptionSet, OptionSource, Timeouts};
use kiln_deploy::{default_options, InstallContext, StaticManifests};

pub fn deployment(ns: &str, name: &str, label: &str) -> String {
    let (k, v) = label.split_once('=').unwrap();
    format!(
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {name}\n  namespace: {ns}\nspec:\n  template:\n    metadata:\n      labels:\n        {k}: {v}\n"
    )
}

pub fn manifests() -> StaticManifests {
    let traefik = format!(
        "{}---\napiVersion: v1\nkind: Service\nmetadata:\n  name: traefik\n  namespace: traefik\n",
        deployment("traefik", "traefik", "app.kubernetes.io/name=traefik")
    );
    let kiln = format!(
        "{}---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: kiln-host\n  namespace: kiln\ndata:\n  host: \"kiln.{{{{system_domain}}}}\"\n",
        deployment("kiln", "kiln-server", "app.kubernetes.io/name=kiln-server")
    );
    let app_ingress = format!(
        "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: app-ingress\n---\n{}",
        deployment("app-ingress", "app-ingress", "name=app-ingress")
    );
    let tekton = format!(
        "{}---\n{}",
        deployment("tekton-pipelines", "tekton-pipelines-controller", "app=tekton-pipelines-controller"),
        deployment("tekton-pipelines", "tekton-pipelines-webhook", "app=tekton-pipelines-webhook")
    );
    let cert_manager = format!(
        "{}---\n{}",
        deployment("cert-manager", "cert-manager", "app.kubernetes.io/name=cert-manager"),
        deployment("cert-manager", "cert-manager-webhook", "app.kubernetes.io/name=webhook")
    );
    StaticManifests::new()
        .with("traefik.yaml", &traefik)
        .with("kiln.yaml", &kiln)
        .with("quarks.yaml", &deployment("quarks", "quarks-secret", "name=quarks-secret"))
        .with("app-ingress.yaml", &app_ingress)
        .with("gitea.yaml", &deployment("gitea", "gitea", "app.kubernetes.io/name=gitea"))
        .with("registry.yaml", &deployment("kiln-registry", "registry", "app.kubernetes.io/name=registry"))
        .with("tekton.yaml", &tekton)
        .with(
            "tekton-staging.yaml",
            "apiVersion: tekton.dev/v1beta1\nkind: Pipeline\nmetadata:\n  name: staging-pipeline\n  namespace: tekton-staging\n",
        )
        .with(
            "service-catalog.yaml",
            &deployment("service-catalog", "catalog-controller-manager", "app=catalog-catalog-controller-manager"),
        )
        .with("cert-manager.yaml", &cert_manager)
        .with(
            "cluster-issuer.yaml",
            "apiVersion: cert-manager.io/v1\nkind: ClusterIssuer\nmetadata:\n  name: {{issuer}}\n",
        )
}

pub fn timeouts() -> Timeouts {
    Timeouts {
        deployment: Duration::from_secs(10),
        poll_interval: Duration::from_secs(1),
        system_domain: Duration::from_secs(3),
        warmup_job: Duration::from_secs(10),
    }
}

pub fn context() -> InstallContext {
    InstallContext::new(Arc::new(manifests()), timeouts())
}

/// Options populated from `flags` then defaults.
pub fn options(flags: &[(&str, &str)]) -> OptionSet {
    let mut src = FlagSource::new();
    for (k, v) in flags {
        src = src.with(*k, *v);
    }
    let mut defaults = DefaultSource::new();
    default_options()
        .unwrap()
        .populate([&mut src as &mut dyn OptionSource, &mut defaults as &mut dyn OptionSource])
        .unwrap()
}
