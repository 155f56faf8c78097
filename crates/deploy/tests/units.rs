use kiln_core::{KilnError, OWNERSHIP_LABEL_KEY, OWNERSHIP_LABEL_VALUE};
use kiln_deploy::{DeploymentUnit, Gitea, Tekton, Workloads, SYSTEM_DOMAIN};
use kiln_kubehub::fake::FakeCluster;
use kiln_kubehub::ClusterOps;

mod support;

#[tokio::test]
async fn workloads_deploy_then_redeploy() {
    let cluster = FakeCluster::new();
    let ctx = support::context();
    let mut opts = support::options(&[("workloads.warmup", "false")]);

    Workloads.deploy(&cluster, &ctx, opts.for_deployment("workloads")).await.unwrap();
    let labels = cluster.namespace_labels("kiln-workloads");
    assert_eq!(labels.get(OWNERSHIP_LABEL_KEY).map(String::as_str), Some(OWNERSHIP_LABEL_VALUE));
    assert_eq!(cluster.secret_names("kiln-workloads"), vec!["gitea-creds", "registry-creds"]);
    let sa = cluster.service_account("kiln-workloads", "kiln-workloads").unwrap();
    assert_eq!(sa.automount_service_account_token, Some(false));
    assert_eq!(sa.image_pull_secrets.map(|s| s.len()), Some(2));
    assert!(cluster.namespace_exists_and_owned("app-ingress").await.unwrap());
    assert!(cluster.job("kiln-workloads", "buildpack-builder-warmup").is_none());

    let before = cluster.mutations();
    let err = Workloads.deploy(&cluster, &ctx, opts.for_deployment("workloads")).await.unwrap_err();
    assert!(matches!(err, KilnError::AlreadyPresent(_)), "err={}", err);
    assert_eq!(cluster.mutations(), before);
    assert_eq!(cluster.secret_names("kiln-workloads").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn held_warmup_job_times_out() {
    let cluster = FakeCluster::new();
    cluster.hold_jobs();
    let ctx = support::context();
    let mut opts = support::options(&[]);
    let err = Workloads.deploy(&cluster, &ctx, opts.for_deployment("workloads")).await.unwrap_err();
    assert!(err.is_timeout(), "err={}", err);
    assert!(cluster.job("kiln-workloads", "buildpack-builder-warmup").is_some());
}

#[tokio::test]
async fn workloads_delete_skips_foreign_namespace() {
    let cluster = FakeCluster::new();
    cluster.add_namespace("kiln-workloads", Default::default());
    Workloads.delete(&cluster, &support::context()).await.unwrap();
    assert!(cluster.has_namespace("kiln-workloads"));
    assert_eq!(cluster.mutations(), 0);
}

#[tokio::test]
async fn tekton_upgrade_requires_an_install() {
    let cluster = FakeCluster::new();
    let ctx = support::context();
    let mut opts = support::options(&[(SYSTEM_DOMAIN, "apps.example.com")]);
    let err = Tekton.upgrade(&cluster, &ctx, opts.for_deployment("tekton")).await.unwrap_err();
    assert!(err.is_not_found());

    Tekton.deploy(&cluster, &ctx, opts.for_deployment("tekton")).await.unwrap();
    assert!(cluster.namespace_exists_and_owned("tekton-staging").await.unwrap());
    Tekton.upgrade(&cluster, &ctx, opts.for_deployment("tekton")).await.unwrap();
    assert!(cluster.applied().iter().any(|a| a == "Pipeline tekton-staging/staging-pipeline"));
}

#[tokio::test(start_paused = true)]
async fn gitea_admin_secret_exists_before_its_pods_start() {
    let cluster = FakeCluster::new();
    cluster.gate_pods_on_secret("gitea", "gitea-admin");
    let mut ctx = support::context();
    ctx.system_domain = Some("apps.example.com".into());
    let mut opts = support::options(&[]);

    Gitea.deploy(&cluster, &ctx, opts.for_deployment("gitea")).await.unwrap();
    let secret = cluster.get_secret("gitea", "gitea-admin").await.unwrap();
    assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/basic-auth"));
    let pods = cluster.list_pods("gitea", "app.kubernetes.io/name=gitea").await.unwrap();
    assert!(kiln_kubehub::wait::pod_is_running(&pods[0]));
}

#[tokio::test(start_paused = true)]
async fn slow_pods_are_waited_for() {
    let cluster = FakeCluster::new();
    cluster.pods_pending_for(4);
    let ctx = support::context();
    let mut opts = support::options(&[]);
    Tekton.deploy(&cluster, &ctx, opts.for_deployment("tekton")).await.unwrap();
    assert!(cluster.namespace_exists_and_owned("tekton-pipelines").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn pods_that_never_start_time_out() {
    let cluster = FakeCluster::new();
    cluster.gate_pods_on_secret("tekton-pipelines", "never-created");
    let ctx = support::context();
    let mut opts = support::options(&[]);
    let err = Tekton.deploy(&cluster, &ctx, opts.for_deployment("tekton")).await.unwrap_err();
    assert!(err.is_timeout(), "err={}", err);
    // the staging namespace is only set up once the pipelines run
    assert!(!cluster.has_namespace("tekton-staging"));
}

#[tokio::test]
async fn workloads_refuse_a_foreign_app_ingress_namespace() {
    let cluster = FakeCluster::new();
    cluster.add_namespace("app-ingress", Default::default());
    let ctx = support::context();
    let mut opts = support::options(&[("workloads.warmup", "false")]);

    let err = Workloads.deploy(&cluster, &ctx, opts.for_deployment("workloads")).await.unwrap_err();
    assert!(matches!(err, KilnError::NotOwned(_)), "err={}", err);
    assert_eq!(cluster.mutations(), 0);
    assert!(cluster.namespace_labels("app-ingress").is_empty());
    assert!(!cluster.has_namespace("kiln-workloads"));
}

#[tokio::test]
async fn tekton_refuses_a_foreign_staging_namespace() {
    let cluster = FakeCluster::new();
    cluster.add_namespace("tekton-staging", Default::default());
    let ctx = support::context();
    let mut opts = support::options(&[]);

    let err = Tekton.deploy(&cluster, &ctx, opts.for_deployment("tekton")).await.unwrap_err();
    assert!(matches!(err, KilnError::NotOwned(_)), "err={}", err);
    assert_eq!(cluster.mutations(), 0);
    assert!(!cluster.applied().iter().any(|a| a.starts_with("Pipeline ")));
}
