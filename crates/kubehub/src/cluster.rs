use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::{
    batch::v1::Job,
    core::v1::{Namespace, Node, Pod, Secret, Service, ServiceAccount},
    networking::v1::Ingress,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kiln_core::{is_owned, KilnError, KilnResult};
use kube::{
    api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Config,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::platform::{self, PlatformInfo};
use crate::{kube_err, ClusterOps, CustomResource, ExecOutput};

/// Cluster handle backed by a live kube client.
pub struct KubeCluster {
    client: Client,
    platform: OnceCell<PlatformInfo>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, platform: OnceCell::new() }
    }

    /// Connect from an explicit kubeconfig path, or infer (KUBECONFIG, ~/.kube/config, in-cluster).
    pub async fn connect(kubeconfig: Option<&Path>) -> KilnResult<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path)
                    .map_err(|e| KilnError::validation(format!("reading kubeconfig {}: {}", path.display(), e)))?;
                Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| KilnError::validation(format!("loading kubeconfig {}: {}", path.display(), e)))?
            }
            None => Config::infer().await.map_err(|e| KilnError::remote(format!("inferring kube config: {}", e)))?,
        };
        let client = Client::try_from(config).map_err(|e| KilnError::remote(format!("creating client: {}", e)))?;
        Ok(Self::new(client))
    }

    fn list_params(selector: &str) -> ListParams {
        if selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(selector)
        }
    }
}

#[async_trait::async_trait]
impl ClusterOps for KubeCluster {
    async fn list_pods(&self, namespace: &str, selector: &str) -> KilnResult<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&Self::list_params(selector))
            .await
            .map_err(|e| kube_err(e, format!("list pods {} [{}]", namespace, selector)))?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> KilnResult<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| kube_err(e, format!("pod {}/{}", namespace, name)))
    }

    async fn list_ingresses(&self, namespace: &str, selector: &str) -> KilnResult<Vec<Ingress>> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&Self::list_params(selector))
            .await
            .map_err(|e| kube_err(e, format!("list ingresses {}", namespace)))?;
        Ok(list.items)
    }

    async fn list_services(&self, namespace: Option<&str>, field_selector: &str) -> KilnResult<Vec<Service>> {
        let api: Api<Service> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let lp = if field_selector.is_empty() { ListParams::default() } else { ListParams::default().fields(field_selector) };
        let list = api.list(&lp).await.map_err(|e| kube_err(e, format!("list services [{}]", field_selector)))?;
        Ok(list.items)
    }

    async fn list_nodes(&self) -> KilnResult<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.map_err(|e| kube_err(e, "list nodes"))?;
        Ok(list.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> KilnResult<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| kube_err(e, format!("secret {}/{}", namespace, name)))
    }

    async fn create_secret(&self, namespace: &str, secret: Secret) -> KilnResult<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), &secret)
            .await
            .map_err(|e| kube_err(e, format!("create secret {}/{}", namespace, name)))?;
        debug!(ns = %namespace, secret = %name, "secret created");
        Ok(())
    }

    async fn create_service_account(&self, namespace: &str, account: ServiceAccount) -> KilnResult<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let name = account.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), &account)
            .await
            .map_err(|e| kube_err(e, format!("create service account {}/{}", namespace, name)))?;
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> KilnResult<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(ns) => Ok(Some(ns)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(kube_err(e, format!("namespace {}", name))),
        }
    }

    async fn create_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> KilnResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta { name: Some(name.to_string()), labels: Some(labels), ..Default::default() },
            ..Default::default()
        };
        api.create(&PostParams::default(), &ns)
            .await
            .map_err(|e| kube_err(e, format!("create namespace {}", name)))?;
        info!(ns = %name, "namespace created");
        Ok(())
    }

    async fn namespace_exists_and_owned(&self, name: &str) -> KilnResult<bool> {
        Ok(self
            .get_namespace(name)
            .await?
            .map(|ns| ns.metadata.labels.as_ref().map(is_owned).unwrap_or(false))
            .unwrap_or(false))
    }

    async fn label_namespace(&self, name: &str, key: &str, value: &str) -> KilnResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "labels": { key: value } } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| kube_err(e, format!("label namespace {}", name)))?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> KilnResult<()> {
        if !self.namespace_exists_and_owned(name).await? {
            return Err(KilnError::NotOwned(name.to_string()));
        }
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| kube_err(e, format!("delete namespace {}", name)))?;
        info!(ns = %name, "namespace deletion requested");
        Ok(())
    }

    async fn create_job(&self, namespace: &str, job: Job) -> KilnResult<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let name = job.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), &job)
            .await
            .map_err(|e| kube_err(e, format!("create job {}/{}", namespace, name)))?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> KilnResult<Job> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| kube_err(e, format!("job {}/{}", namespace, name)))
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: &str,
        stdin: Option<&str>,
    ) -> KilnResult<ExecOutput> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut ap = AttachParams::default().stdin(stdin.is_some()).stdout(true).stderr(true);
        if let Some(c) = container {
            ap = ap.container(c);
        }
        let what = format!("exec in {}/{}", namespace, pod);
        let mut attached = api.exec(pod, vec!["sh", "-c", command], &ap).await.map_err(|e| kube_err(e, &what))?;

        // stdin is fed while the output streams drain so a chatty command cannot stall on a full pipe
        let writer = attached.stdin();
        let out_reader = attached.stdout();
        let err_reader = attached.stderr();
        let status = attached.take_status();
        let mut stdout = String::new();
        let mut stderr = String::new();
        let write_in = async {
            if let (Some(input), Some(mut w)) = (stdin, writer) {
                w.write_all(input.as_bytes()).await?;
                w.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_out = async {
            if let Some(mut r) = out_reader {
                r.read_to_string(&mut stdout).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_err = async {
            if let Some(mut r) = err_reader {
                r.read_to_string(&mut stderr).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (w, o, e) = tokio::join!(write_in, read_out, read_err);
        w?;
        o?;
        e?;

        if let Some(status) = status {
            if let Some(s) = status.await {
                if s.status.as_deref() == Some("Failure") {
                    return Err(KilnError::remote(format!(
                        "{}: {} (stderr: {})",
                        what,
                        s.message.unwrap_or_default(),
                        stderr.trim()
                    )));
                }
            }
        }
        attached.join().await.map_err(|e| KilnError::remote(format!("{}: {}", what, e)))?;
        Ok(ExecOutput { stdout: stdout.trim().to_string(), stderr: stderr.trim().to_string() })
    }

    async fn server_version(&self) -> KilnResult<String> {
        let info = self.client.apiserver_version().await.map_err(|e| kube_err(e, "server version"))?;
        Ok(info.git_version)
    }

    async fn apply_manifest(&self, yaml: &str, namespace: Option<&str>) -> KilnResult<usize> {
        kiln_apply::apply_manifest(&self.client, yaml, namespace)
            .await
            .map_err(|e| KilnError::remote(format!("{:#}", e)))
    }

    async fn delete_manifest(&self, yaml: &str, namespace: Option<&str>) -> KilnResult<usize> {
        kiln_apply::delete_manifest(&self.client, yaml, namespace)
            .await
            .map_err(|e| KilnError::remote(format!("{:#}", e)))
    }

    async fn create_custom(&self, resource: &CustomResource, namespace: &str, object: serde_json::Value) -> KilnResult<()> {
        let gvk = GroupVersionKind::gvk(resource.group, resource.version, resource.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, resource.plural);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let obj: DynamicObject = serde_json::from_value(object)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), &obj)
            .await
            .map_err(|e| kube_err(e, format!("create {} {}/{}", resource.kind, namespace, name)))?;
        debug!(kind = resource.kind, ns = %namespace, name = %name, "custom resource created");
        Ok(())
    }

    async fn platform(&self) -> KilnResult<PlatformInfo> {
        self.platform.get_or_try_init(|| platform::resolve(self)).await.cloned()
    }
}
