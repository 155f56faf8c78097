use std::path::Path;
use std::sync::{Arc, Mutex};

use kiln_core::{KilnError, KilnResult, OptionOrigin, ScopedOptions};
use kiln_deploy::{standard_units, DeploymentUnit, InstallContext, Orchestrator, SYSTEM_DOMAIN};
use kiln_kubehub::fake::FakeCluster;
use kiln_kubehub::ClusterOps;

mod support;

const NAMESPACES: &[&str] = &[
    "traefik",
    "kiln",
    "quarks",
    "kiln-workloads",
    "app-ingress",
    "gitea",
    "kiln-registry",
    "tekton-pipelines",
    "tekton-staging",
    "service-catalog",
    "cert-manager",
];

#[tokio::test]
async fn install_creates_every_owned_namespace() {
    let cluster = FakeCluster::new();
    let mut opts = support::options(&[(SYSTEM_DOMAIN, "apps.example.com")]);
    let mut orch = Orchestrator::new(&cluster, standard_units(), support::context());
    orch.install(&mut opts).await.unwrap();

    for ns in NAMESPACES {
        assert!(cluster.namespace_exists_and_owned(ns).await.unwrap(), "namespace {}", ns);
    }
    assert_eq!(orch.system_domain(), Some("apps.example.com"));
    assert!(cluster.applied().iter().any(|a| a == "ClusterIssuer /letsencrypt-production"));
    assert!(cluster.job("kiln-workloads", "buildpack-builder-warmup").is_some());
}

#[tokio::test]
async fn second_install_is_rejected_without_changes() {
    let cluster = FakeCluster::new();
    let mut opts = support::options(&[(SYSTEM_DOMAIN, "apps.example.com")]);
    Orchestrator::new(&cluster, standard_units(), support::context()).install(&mut opts).await.unwrap();
    let before = cluster.mutations();

    let err = Orchestrator::new(&cluster, standard_units(), support::context()).install(&mut opts).await.unwrap_err();
    assert!(matches!(err, KilnError::AlreadyPresent(ref m) if m.contains("traefik")), "err={}", err);
    assert_eq!(cluster.mutations(), before);
}

#[tokio::test]
async fn domain_is_synthesized_from_the_ingress_address() {
    let cluster = FakeCluster::new();
    cluster.add_load_balancer("traefik", "traefik", "10.1.2.3");
    let mut opts = support::options(&[]);
    let mut orch = Orchestrator::new(&cluster, standard_units(), support::context());
    orch.install(&mut opts).await.unwrap();

    assert_eq!(orch.system_domain(), Some("10.1.2.3.nip.io"));
    assert_eq!(opts.get_string(SYSTEM_DOMAIN).unwrap(), "10.1.2.3.nip.io");
    assert_eq!(opts.get(SYSTEM_DOMAIN).unwrap().origin(), Some(OptionOrigin::Computed));
}

#[tokio::test(start_paused = true)]
async fn missing_ingress_address_fails_the_first_unit_needing_a_domain() {
    let cluster = FakeCluster::new();
    let mut opts = support::options(&[]);
    let mut orch = Orchestrator::new(&cluster, standard_units(), support::context());
    let err = orch.install(&mut opts).await.unwrap_err();

    assert!(matches!(err, KilnError::Validation(ref m) if m.contains("kiln")), "err={}", err);
    assert!(cluster.has_namespace("traefik"));
    assert!(!cluster.has_namespace("kiln"));
    assert_eq!(orch.system_domain(), None);
}

#[tokio::test]
async fn first_failure_stops_the_run() {
    let cluster = FakeCluster::new();
    cluster.fail_next("create_secret", KilnError::remote("secret quota exceeded"));
    let mut opts = support::options(&[(SYSTEM_DOMAIN, "apps.example.com")]);
    let err = Orchestrator::new(&cluster, standard_units(), support::context()).install(&mut opts).await.unwrap_err();

    assert!(matches!(err, KilnError::Remote(ref m) if m == "secret quota exceeded"), "err={}", err);
    assert!(cluster.has_namespace("kiln-workloads"));
    assert!(!cluster.has_namespace("gitea"));
    assert!(!cluster.has_namespace("cert-manager"));
}

#[tokio::test]
async fn uninstall_removes_what_install_created() {
    let cluster = FakeCluster::new();
    let mut opts = support::options(&[(SYSTEM_DOMAIN, "apps.example.com")]);
    let mut orch = Orchestrator::new(&cluster, standard_units(), support::context());
    orch.install(&mut opts).await.unwrap();
    orch.uninstall().await.unwrap();

    for ns in NAMESPACES {
        assert!(!cluster.has_namespace(ns), "namespace {} survived", ns);
    }
    assert!(cluster.applied().iter().all(|a| !a.starts_with("ClusterIssuer")));
}

#[tokio::test]
async fn uninstall_leaves_foreign_namespaces_alone() {
    let cluster = FakeCluster::new();
    cluster.add_namespace("gitea", Default::default());
    let orch = Orchestrator::new(&cluster, standard_units(), support::context());
    orch.uninstall().await.unwrap();

    assert!(cluster.has_namespace("gitea"));
    assert_eq!(cluster.mutations(), 0);
}

#[tokio::test]
async fn gitea_credentials_survive_backup_and_restore() {
    let dir = std::env::temp_dir().join(format!("kiln-backup-{}", uuid::Uuid::new_v4()));
    let source = FakeCluster::new();
    let mut opts = support::options(&[(SYSTEM_DOMAIN, "apps.example.com"), ("gitea.admin_password", "hunter2")]);
    let mut orch = Orchestrator::new(&source, standard_units(), support::context());
    orch.install(&mut opts).await.unwrap();
    orch.backup(&dir).await.unwrap();
    assert!(dir.join("backup.json").is_file());
    assert!(dir.join("gitea").join("gitea-admin.json").is_file());

    let target = FakeCluster::new();
    target.add_namespace("gitea", FakeCluster::owned_labels());
    Orchestrator::new(&target, standard_units(), support::context()).restore(&dir).await.unwrap();
    let secret = target.get_secret("gitea", "gitea-admin").await.unwrap();
    let password = secret.string_data.as_ref().and_then(|d| d.get("password")).cloned();
    assert_eq!(password.as_deref(), Some("hunter2"));

    // restoring twice is fine
    Orchestrator::new(&target, standard_units(), support::context()).restore(&dir).await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn restore_from_missing_directory_is_not_found() {
    let cluster = FakeCluster::new();
    let orch = Orchestrator::new(&cluster, standard_units(), support::context());
    let err = orch.restore(Path::new("/nonexistent/kiln-backup")).await.unwrap_err();
    assert!(err.is_not_found());
}

/// Records every lifecycle call into a shared journal.
struct Recorder {
    id: &'static str,
    journal: Arc<Mutex<Vec<String>>>,
    fail_delete: bool,
}

impl Recorder {
    fn note(&self, op: &str) {
        self.journal.lock().unwrap().push(format!("{}:{}", op, self.id));
    }
}

#[async_trait::async_trait]
impl DeploymentUnit for Recorder {
    fn id(&self) -> &str {
        self.id
    }

    fn describe(&self) -> String {
        format!("recorder {}", self.id)
    }

    fn version(&self) -> &str {
        "0"
    }

    async fn deploy(&self, _c: &dyn ClusterOps, _x: &InstallContext, _o: ScopedOptions<'_>) -> KilnResult<()> {
        self.note("deploy");
        Ok(())
    }

    async fn upgrade(&self, _c: &dyn ClusterOps, _x: &InstallContext, _o: ScopedOptions<'_>) -> KilnResult<()> {
        self.note("upgrade");
        Ok(())
    }

    async fn delete(&self, _c: &dyn ClusterOps, _x: &InstallContext) -> KilnResult<()> {
        self.note("delete");
        if self.fail_delete {
            return Err(KilnError::remote(format!("{} stuck", self.id)));
        }
        Ok(())
    }

    async fn backup(&self, _c: &dyn ClusterOps, _x: &InstallContext, _d: &Path) -> KilnResult<()> {
        Ok(())
    }

    async fn restore(&self, _c: &dyn ClusterOps, _x: &InstallContext, _d: &Path) -> KilnResult<()> {
        Ok(())
    }
}

fn recorders(journal: &Arc<Mutex<Vec<String>>>, failing: Option<&str>) -> Vec<Recorder> {
    ["a", "b", "c"]
        .into_iter()
        .map(|id| Recorder { id, journal: journal.clone(), fail_delete: failing == Some(id) })
        .collect()
}

#[tokio::test]
async fn uninstall_walks_units_in_reverse() {
    let cluster = FakeCluster::new();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut orch = Orchestrator::new(&cluster, recorders(&journal, None), support::context());
    let mut opts = support::options(&[]);
    orch.install(&mut opts).await.unwrap();
    orch.uninstall().await.unwrap();
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["deploy:a", "deploy:b", "deploy:c", "delete:c", "delete:b", "delete:a"]
    );
}

#[tokio::test]
async fn uninstall_stops_at_the_first_failure() {
    let cluster = FakeCluster::new();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let orch = Orchestrator::new(&cluster, recorders(&journal, Some("b")), support::context());
    let err = orch.uninstall().await.unwrap_err();
    assert_eq!(err.to_string(), "remote api: b stuck");
    assert_eq!(*journal.lock().unwrap(), vec!["delete:c", "delete:b"]);
}

#[tokio::test]
async fn describe_lists_units_in_install_order() {
    let cluster = FakeCluster::new();
    let orch = Orchestrator::new(&cluster, standard_units(), support::context());
    let ids: Vec<String> = orch.describe().into_iter().map(|u| u.id).collect();
    assert_eq!(ids.first().map(String::as_str), Some("traefik"));
    assert_eq!(ids.last().map(String::as_str), Some("cert-manager"));
    assert_eq!(ids.len(), 9);
}
