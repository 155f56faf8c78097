//! In-memory [`ClusterOps`] for tests.
//!
//! Applying a manifest materialises its objects: workload kinds (Deployment, StatefulSet,
//! DaemonSet, Pod) get one Running pod carrying the template labels, `Namespace` documents create
//! unowned namespaces. Jobs complete as soon as they are created. Every successful mutation bumps
//! [`FakeCluster::mutations`].
//!
//! Pods can be made to start slowly: [`FakeCluster::pods_pending_for`] keeps new pods Pending for a
//! number of observations, [`FakeCluster::gate_pods_on_secret`] keeps them Pending until a secret
//! exists in their namespace.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use k8s_openapi::api::{
    batch::v1::{Job, JobStatus},
    core::v1::{
        ContainerState, ContainerStateRunning, ContainerStatus, LoadBalancerIngress, LoadBalancerStatus, Namespace, Node,
        Pod, PodStatus, Secret, Service, ServiceAccount, ServiceStatus,
    },
    networking::v1::Ingress,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kiln_core::{is_owned, KilnError, KilnResult, OWNERSHIP_LABEL_KEY, OWNERSHIP_LABEL_VALUE};
use serde_json::Value;

use crate::platform::{self, PlatformInfo};
use crate::{selector_matches, ClusterOps, CustomResource, ExecOutput};

type Key = (String, String);

fn key(ns: &str, name: &str) -> Key {
    (ns.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    pods: BTreeMap<Key, Pod>,
    services: BTreeMap<Key, Service>,
    ingresses: BTreeMap<Key, Ingress>,
    nodes: Vec<Node>,
    secrets: BTreeMap<Key, Secret>,
    accounts: BTreeMap<Key, ServiceAccount>,
    jobs: BTreeMap<Key, Job>,
    /// (kind, namespace, name) -> object
    customs: BTreeMap<(String, String, String), Value>,
    /// `Kind ns/name` of every object currently applied from manifests
    applied: Vec<String>,
    exec_log: Vec<(String, String, String)>,
    exec_replies: HashMap<String, ExecOutput>,
    failures: HashMap<String, KilnError>,
    hold_jobs: bool,
    /// observations a new workload pod stays Pending for
    pending_polls: usize,
    /// namespace -> secret its pods need before they can run
    secret_gates: BTreeMap<String, String>,
    /// pods still Pending, with the observations left
    pending: BTreeMap<Key, usize>,
    mutations: usize,
    platform: Option<PlatformInfo>,
}

pub struct FakeCluster {
    state: Mutex<State>,
    version: String,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn running_pod(ns: &str, name: &str, labels: BTreeMap<String, String>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".into()),
            container_statuses: Some(vec![ContainerStatus {
                name: "main".into(),
                ready: true,
                state: Some(ContainerState { running: Some(ContainerStateRunning::default()), ..Default::default() }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn string_map(v: Option<&Value>) -> BTreeMap<String, String> {
    v.and_then(|m| m.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

impl FakeCluster {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()), version: "v1.29.2".to_string() }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, op: &str) -> KilnResult<()> {
        match self.lock().failures.remove(op) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Labels that mark a namespace as Kiln-owned.
    pub fn owned_labels() -> BTreeMap<String, String> {
        BTreeMap::from([(OWNERSHIP_LABEL_KEY.to_string(), OWNERSHIP_LABEL_VALUE.to_string())])
    }

    /// Make the next call of `op` (a [`ClusterOps`] method name) fail with `err`.
    pub fn fail_next(&self, op: &str, err: KilnError) {
        self.lock().failures.insert(op.to_string(), err);
    }

    /// Keep created jobs incomplete.
    pub fn hold_jobs(&self) {
        self.lock().hold_jobs = true;
    }

    /// New workload pods report Pending for the next `polls` observations, then Running.
    pub fn pods_pending_for(&self, polls: usize) {
        self.lock().pending_polls = polls;
    }

    /// Pods created in `namespace` stay Pending until secret `namespace/secret` exists.
    pub fn gate_pods_on_secret(&self, namespace: &str, secret: &str) {
        self.lock().secret_gates.insert(namespace.to_string(), secret.to_string());
    }

    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    // seeding does not count as mutation

    pub fn add_namespace(&self, name: &str, labels: BTreeMap<String, String>) {
        let ns = Namespace {
            metadata: ObjectMeta { name: Some(name.to_string()), labels: Some(labels), ..Default::default() },
            ..Default::default()
        };
        self.lock().namespaces.insert(name.to_string(), ns);
    }

    pub fn add_pod(&self, pod: Pod) {
        let ns = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.lock().pods.insert(key(&ns, &name), pod);
    }

    pub fn add_running_pod(&self, ns: &str, name: &str, labels: &[(&str, &str)]) {
        let labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.add_pod(running_pod(ns, name, labels));
    }

    pub fn add_node(&self, node: Node) {
        self.lock().nodes.push(node);
    }

    pub fn add_ingress(&self, ingress: Ingress) {
        let ns = ingress.metadata.namespace.clone().unwrap_or_default();
        let name = ingress.metadata.name.clone().unwrap_or_default();
        self.lock().ingresses.insert(key(&ns, &name), ingress);
    }

    /// Give service `ns/name` a load-balancer IP, creating it if needed.
    pub fn add_load_balancer(&self, ns: &str, name: &str, ip: &str) {
        let mut st = self.lock();
        let svc = st.services.entry(key(ns, name)).or_insert_with(|| Service {
            metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(ns.to_string()), ..Default::default() },
            ..Default::default()
        });
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress { ip: Some(ip.to_string()), ..Default::default() }]),
            }),
            ..Default::default()
        });
    }

    /// Reply returned by `exec_in_pod` for exactly this command.
    pub fn set_exec_reply(&self, command: &str, out: ExecOutput) {
        self.lock().exec_replies.insert(command.to_string(), out);
    }

    pub fn exec_log(&self) -> Vec<(String, String, String)> {
        self.lock().exec_log.clone()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.lock().namespaces.contains_key(name)
    }

    pub fn namespace_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.lock().namespaces.get(name).and_then(|n| n.metadata.labels.clone()).unwrap_or_default()
    }

    pub fn secret_names(&self, ns: &str) -> Vec<String> {
        self.lock().secrets.keys().filter(|(n, _)| n == ns).map(|(_, s)| s.clone()).collect()
    }

    pub fn service_account(&self, ns: &str, name: &str) -> Option<ServiceAccount> {
        self.lock().accounts.get(&key(ns, name)).cloned()
    }

    pub fn job(&self, ns: &str, name: &str) -> Option<Job> {
        self.lock().jobs.get(&key(ns, name)).cloned()
    }

    pub fn custom_objects(&self, kind: &str) -> Vec<Value> {
        self.lock().customs.iter().filter(|((k, _, _), _)| k == kind).map(|(_, v)| v.clone()).collect()
    }

    pub fn applied(&self) -> Vec<String> {
        self.lock().applied.clone()
    }

    fn materialise(st: &mut State, obj: &kiln_apply::ManifestObject) {
        let ns = obj.namespace.clone().unwrap_or_else(|| "default".to_string());
        match obj.gvk.kind.as_str() {
            "Namespace" => {
                let labels = string_map(obj.json.pointer("/metadata/labels"));
                st.namespaces.entry(obj.name.clone()).or_insert_with(|| Namespace {
                    metadata: ObjectMeta { name: Some(obj.name.clone()), labels: Some(labels), ..Default::default() },
                    ..Default::default()
                });
            }
            "Deployment" | "StatefulSet" | "DaemonSet" => {
                let labels = string_map(obj.json.pointer("/spec/template/metadata/labels"));
                Self::spawn_pod(st, &ns, &format!("{}-0", obj.name), labels);
            }
            "Pod" => {
                let labels = string_map(obj.json.pointer("/metadata/labels"));
                Self::spawn_pod(st, &ns, &obj.name, labels);
            }
            "Service" => {
                st.services.entry(key(&ns, &obj.name)).or_insert_with(|| Service {
                    metadata: ObjectMeta { name: Some(obj.name.clone()), namespace: Some(ns.clone()), ..Default::default() },
                    ..Default::default()
                });
            }
            _ => {}
        }
    }

    fn spawn_pod(st: &mut State, ns: &str, name: &str, labels: BTreeMap<String, String>) {
        let k = key(ns, name);
        let mut pod = running_pod(ns, name, labels);
        if st.pending_polls > 0 || st.secret_gates.contains_key(ns) {
            pod.status = Some(PodStatus { phase: Some("Pending".into()), ..Default::default() });
            st.pending.insert(k.clone(), st.pending_polls);
        }
        st.pods.insert(k, pod);
    }

    /// One observation of the pods in `namespace`: count down Pending pods whose gate is open and
    /// start the ones that are due.
    fn observe(st: &mut State, namespace: &str) {
        let gate = st.secret_gates.get(namespace).map(|s| key(namespace, s));
        if gate.as_ref().is_some_and(|g| !st.secrets.contains_key(g)) {
            return;
        }
        let mut started = Vec::new();
        for (k, left) in st.pending.iter_mut().filter(|((ns, _), _)| ns == namespace) {
            if *left == 0 {
                started.push(k.clone());
            } else {
                *left -= 1;
            }
        }
        for k in started {
            st.pending.remove(&k);
            if let Some(pod) = st.pods.get_mut(&k) {
                let labels = pod.metadata.labels.clone().unwrap_or_default();
                *pod = running_pod(&k.0, &k.1, labels);
            }
        }
    }

    fn dematerialise(st: &mut State, obj: &kiln_apply::ManifestObject) {
        let ns = obj.namespace.clone().unwrap_or_else(|| "default".to_string());
        match obj.gvk.kind.as_str() {
            "Namespace" => {
                Self::drop_namespace(st, &obj.name);
            }
            "Deployment" | "StatefulSet" | "DaemonSet" => {
                let k = key(&ns, &format!("{}-0", obj.name));
                st.pending.remove(&k);
                st.pods.remove(&k);
            }
            "Pod" => {
                st.pending.remove(&key(&ns, &obj.name));
                st.pods.remove(&key(&ns, &obj.name));
            }
            "Service" => {
                st.services.remove(&key(&ns, &obj.name));
            }
            _ => {}
        }
    }

    fn drop_namespace(st: &mut State, name: &str) {
        st.namespaces.remove(name);
        st.pods.retain(|(ns, _), _| ns != name);
        st.pending.retain(|(ns, _), _| ns != name);
        st.services.retain(|(ns, _), _| ns != name);
        st.ingresses.retain(|(ns, _), _| ns != name);
        st.secrets.retain(|(ns, _), _| ns != name);
        st.accounts.retain(|(ns, _), _| ns != name);
        st.jobs.retain(|(ns, _), _| ns != name);
        st.customs.retain(|(_, ns, _), _| ns != name);
        let marker = format!(" {}/", name);
        st.applied.retain(|a| !a.contains(&marker));
    }
}

fn not_found(what: String) -> KilnError {
    KilnError::NotFound(what)
}

#[async_trait::async_trait]
impl ClusterOps for FakeCluster {
    async fn list_pods(&self, namespace: &str, selector: &str) -> KilnResult<Vec<Pod>> {
        self.check("list_pods")?;
        let mut st = self.lock();
        Self::observe(&mut st, namespace);
        Ok(st
            .pods
            .iter()
            .filter(|((ns, _), p)| ns == namespace && selector_matches(selector, p.metadata.labels.as_ref()))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> KilnResult<Pod> {
        self.check("get_pod")?;
        let mut st = self.lock();
        Self::observe(&mut st, namespace);
        let pod = st.pods.get(&key(namespace, name)).cloned();
        pod.ok_or_else(|| not_found(format!("pod {}/{}", namespace, name)))
    }

    async fn list_ingresses(&self, namespace: &str, selector: &str) -> KilnResult<Vec<Ingress>> {
        self.check("list_ingresses")?;
        let st = self.lock();
        Ok(st
            .ingresses
            .iter()
            .filter(|((ns, _), i)| ns == namespace && selector_matches(selector, i.metadata.labels.as_ref()))
            .map(|(_, i)| i.clone())
            .collect())
    }

    async fn list_services(&self, namespace: Option<&str>, field_selector: &str) -> KilnResult<Vec<Service>> {
        self.check("list_services")?;
        // only metadata.name / metadata.namespace field selectors are understood
        let mut want_name = None;
        let mut want_ns = namespace.map(|s| s.to_string());
        for term in field_selector.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match term.split_once('=') {
                Some(("metadata.name", v)) => want_name = Some(v.to_string()),
                Some(("metadata.namespace", v)) => want_ns = Some(v.to_string()),
                _ => return Err(KilnError::validation(format!("unsupported field selector {}", term))),
            }
        }
        let st = self.lock();
        Ok(st
            .services
            .iter()
            .filter(|((ns, name), _)| {
                want_ns.as_deref().map(|w| w == ns).unwrap_or(true) && want_name.as_deref().map(|w| w == name).unwrap_or(true)
            })
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn list_nodes(&self) -> KilnResult<Vec<Node>> {
        self.check("list_nodes")?;
        Ok(self.lock().nodes.clone())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> KilnResult<Secret> {
        self.check("get_secret")?;
        self.lock()
            .secrets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found(format!("secret {}/{}", namespace, name)))
    }

    async fn create_secret(&self, namespace: &str, mut secret: Secret) -> KilnResult<()> {
        self.check("create_secret")?;
        let name = secret.metadata.name.clone().unwrap_or_default();
        let mut st = self.lock();
        if !st.namespaces.contains_key(namespace) {
            return Err(not_found(format!("namespace {}", namespace)));
        }
        if st.secrets.contains_key(&key(namespace, &name)) {
            return Err(KilnError::AlreadyExists(format!("secret {}/{}", namespace, name)));
        }
        secret.metadata.namespace = Some(namespace.to_string());
        st.secrets.insert(key(namespace, &name), secret);
        st.mutations += 1;
        Ok(())
    }

    async fn create_service_account(&self, namespace: &str, mut account: ServiceAccount) -> KilnResult<()> {
        self.check("create_service_account")?;
        let name = account.metadata.name.clone().unwrap_or_default();
        let mut st = self.lock();
        if !st.namespaces.contains_key(namespace) {
            return Err(not_found(format!("namespace {}", namespace)));
        }
        if st.accounts.contains_key(&key(namespace, &name)) {
            return Err(KilnError::AlreadyExists(format!("service account {}/{}", namespace, name)));
        }
        account.metadata.namespace = Some(namespace.to_string());
        st.accounts.insert(key(namespace, &name), account);
        st.mutations += 1;
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> KilnResult<Option<Namespace>> {
        self.check("get_namespace")?;
        Ok(self.lock().namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> KilnResult<()> {
        self.check("create_namespace")?;
        if self.has_namespace(name) {
            return Err(KilnError::AlreadyExists(format!("namespace {}", name)));
        }
        self.add_namespace(name, labels);
        self.lock().mutations += 1;
        Ok(())
    }

    async fn namespace_exists_and_owned(&self, name: &str) -> KilnResult<bool> {
        self.check("namespace_exists_and_owned")?;
        Ok(self
            .lock()
            .namespaces
            .get(name)
            .map(|ns| ns.metadata.labels.as_ref().map(|l| is_owned(l)).unwrap_or(false))
            .unwrap_or(false))
    }

    async fn label_namespace(&self, name: &str, key_: &str, value: &str) -> KilnResult<()> {
        self.check("label_namespace")?;
        let mut st = self.lock();
        let ns = st.namespaces.get_mut(name).ok_or_else(|| not_found(format!("namespace {}", name)))?;
        ns.metadata.labels.get_or_insert_with(BTreeMap::new).insert(key_.to_string(), value.to_string());
        st.mutations += 1;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> KilnResult<()> {
        self.check("delete_namespace")?;
        if !self.namespace_exists_and_owned(name).await? {
            return Err(KilnError::NotOwned(name.to_string()));
        }
        let mut st = self.lock();
        Self::drop_namespace(&mut st, name);
        st.mutations += 1;
        Ok(())
    }

    async fn create_job(&self, namespace: &str, mut job: Job) -> KilnResult<()> {
        self.check("create_job")?;
        let name = job.metadata.name.clone().unwrap_or_default();
        let mut st = self.lock();
        if st.jobs.contains_key(&key(namespace, &name)) {
            return Err(KilnError::AlreadyExists(format!("job {}/{}", namespace, name)));
        }
        if !st.hold_jobs {
            let want = job.spec.as_ref().and_then(|s| s.completions).unwrap_or(1);
            job.status = Some(JobStatus { succeeded: Some(want), ..Default::default() });
        }
        job.metadata.namespace = Some(namespace.to_string());
        st.jobs.insert(key(namespace, &name), job);
        st.mutations += 1;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> KilnResult<Job> {
        self.check("get_job")?;
        self.lock()
            .jobs
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found(format!("job {}/{}", namespace, name)))
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        _container: Option<&str>,
        command: &str,
        _stdin: Option<&str>,
    ) -> KilnResult<ExecOutput> {
        self.check("exec_in_pod")?;
        let mut st = self.lock();
        if !st.pods.contains_key(&key(namespace, pod)) {
            return Err(not_found(format!("pod {}/{}", namespace, pod)));
        }
        st.exec_log.push((namespace.to_string(), pod.to_string(), command.to_string()));
        let out = st.exec_replies.get(command).cloned().unwrap_or_default();
        Ok(ExecOutput { stdout: out.stdout.trim().to_string(), stderr: out.stderr.trim().to_string() })
    }

    async fn server_version(&self) -> KilnResult<String> {
        self.check("server_version")?;
        Ok(self.version.clone())
    }

    async fn apply_manifest(&self, yaml: &str, namespace: Option<&str>) -> KilnResult<usize> {
        self.check("apply_manifest")?;
        let objects = kiln_apply::parse_manifest(yaml, namespace).map_err(|e| KilnError::validation(format!("{:#}", e)))?;
        let mut st = self.lock();
        for obj in &objects {
            let label = format!("{} {}/{}", obj.gvk.kind, obj.namespace.as_deref().unwrap_or(""), obj.name);
            Self::materialise(&mut st, obj);
            if !st.applied.contains(&label) {
                st.applied.push(label);
            }
        }
        st.mutations += 1;
        Ok(objects.len())
    }

    async fn delete_manifest(&self, yaml: &str, namespace: Option<&str>) -> KilnResult<usize> {
        self.check("delete_manifest")?;
        let objects = kiln_apply::parse_manifest(yaml, namespace).map_err(|e| KilnError::validation(format!("{:#}", e)))?;
        let mut st = self.lock();
        let mut deleted = 0;
        for obj in objects.iter().rev() {
            let label = format!("{} {}/{}", obj.gvk.kind, obj.namespace.as_deref().unwrap_or(""), obj.name);
            if let Some(pos) = st.applied.iter().position(|a| a == &label) {
                st.applied.remove(pos);
                deleted += 1;
            }
            Self::dematerialise(&mut st, obj);
        }
        st.mutations += 1;
        Ok(deleted)
    }

    async fn create_custom(&self, resource: &CustomResource, namespace: &str, object: Value) -> KilnResult<()> {
        self.check("create_custom")?;
        let name = object.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        if name.is_empty() {
            return Err(KilnError::validation(format!("{} without metadata.name", resource.kind)));
        }
        let mut st = self.lock();
        let k = (resource.kind.to_string(), namespace.to_string(), name.clone());
        if st.customs.contains_key(&k) {
            return Err(KilnError::AlreadyExists(format!("{} {}/{}", resource.kind, namespace, name)));
        }
        st.customs.insert(k, object);
        st.mutations += 1;
        Ok(())
    }

    async fn platform(&self) -> KilnResult<PlatformInfo> {
        let cached = self.lock().platform.clone();
        if let Some(p) = cached {
            return Ok(p);
        }
        let info = platform::resolve(self).await?;
        self.lock().platform = Some(info.clone());
        Ok(info)
    }
}
