//! Kiln apply: multi-document manifest parsing plus server-side apply and delete.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info};

/// Field manager recorded on every object Kiln applies.
pub const FIELD_MANAGER: &str = "kiln";

fn max_yaml_bytes() -> usize {
    std::env::var("KILN_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(8_000_000) // subsystem bundles (CRDs) run large
}

fn max_yaml_nodes() -> usize {
    std::env::var("KILN_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2_000_000)
}

fn count_nodes(v: &Json, cur: &mut usize, max: usize) {
    if *cur >= max {
        return;
    }
    *cur += 1;
    match v {
        Json::Object(map) => map.values().for_each(|vv| count_nodes(vv, cur, max)),
        Json::Array(arr) => arr.iter().for_each(|vv| count_nodes(vv, cur, max)),
        _ => {}
    }
}

/// One object out of a manifest stream.
#[derive(Debug, Clone)]
pub struct ManifestObject {
    pub json: Json,
    pub gvk: GroupVersionKind,
    pub name: String,
    pub namespace: Option<String>,
}

impl ManifestObject {
    pub fn describe(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{} {}/{}", self.gvk.group, self.gvk.kind, ns, self.name),
            None => format!("{}/{} {}", self.gvk.group, self.gvk.kind, self.name),
        }
    }
}

/// Split a `---` separated stream into objects. Empty documents are skipped.
///
/// `ns_override` wins over `metadata.namespace` and is written back into the object.
pub fn parse_manifest(yaml: &str, ns_override: Option<&str>) -> Result<Vec<ManifestObject>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("manifest too large (>{} bytes)", max_yaml_bytes()));
    }
    let budget = max_yaml_nodes();
    let mut nodes = 0usize;
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", idx))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        count_nodes(&json, &mut nodes, budget);
        if nodes >= budget {
            return Err(anyhow!("manifest too complex (>{} nodes)", budget));
        }
        out.push(object_from_json(json, ns_override).with_context(|| format!("document {}", idx))?);
    }
    Ok(out)
}

fn object_from_json(mut json: Json, ns_override: Option<&str>) -> Result<ManifestObject> {
    let api_version = json
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing apiVersion"))?
        .to_string();
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("missing kind"))?.to_string();
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version),
    };
    let name = json
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing metadata.name"))?
        .to_string();
    let namespace = match ns_override {
        Some(ns) => {
            if let Some(meta) = json.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert("namespace".into(), Json::String(ns.to_string()));
            }
            Some(ns.to_string())
        }
        None => json.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(|s| s.to_string()),
    };
    Ok(ManifestObject { json, gvk: GroupVersionKind { group, version, kind }, name, namespace })
}

fn find_api_resource(discovery: &Discovery, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar, matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn dynamic_api(client: &Client, ar: &ApiResource, namespaced: bool, obj: &ManifestObject) -> Result<Api<DynamicObject>> {
    if !namespaced {
        return Ok(Api::all_with(client.clone(), ar));
    }
    match obj.namespace.as_deref() {
        Some(ns) => Ok(Api::namespaced_with(client.clone(), ns, ar)),
        None => Err(anyhow!("namespace required for {}", obj.describe())),
    }
}

/// Server-side apply every object in `yaml`, in document order. Returns the number applied.
///
/// Discovery runs once per call, after each CRD in the stream so later documents can use it.
pub async fn apply_manifest(client: &Client, yaml: &str, ns_override: Option<&str>) -> Result<usize> {
    let t0 = std::time::Instant::now();
    let objects = parse_manifest(yaml, ns_override)?;
    let mut discovery = Discovery::new(client.clone()).run().await.context("api discovery")?;
    let pp = PatchParams::apply(FIELD_MANAGER).force();
    for obj in &objects {
        let (ar, namespaced) = match find_api_resource(&discovery, &obj.gvk) {
            Ok(found) => found,
            Err(_) => {
                // CRD registered earlier in this stream
                discovery = Discovery::new(client.clone()).run().await.context("api discovery")?;
                find_api_resource(&discovery, &obj.gvk)?
            }
        };
        let api = dynamic_api(client, &ar, namespaced, obj)?;
        if let Err(e) = api.patch(&obj.name, &pp, &Patch::Apply(&obj.json)).await {
            counter!("apply_err", 1u64);
            return Err(anyhow!("server-side apply of {} failed: {}", obj.describe(), e));
        }
        debug!(object = %obj.describe(), "applied");
    }
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("apply_ok", 1u64);
    info!(objects = objects.len(), ns = ?ns_override, "manifest applied");
    Ok(objects.len())
}

/// Delete every object in `yaml`, last document first. Objects already gone are skipped.
pub async fn delete_manifest(client: &Client, yaml: &str, ns_override: Option<&str>) -> Result<usize> {
    let objects = parse_manifest(yaml, ns_override)?;
    let discovery = Discovery::new(client.clone()).run().await.context("api discovery")?;
    let mut deleted = 0usize;
    for obj in objects.iter().rev() {
        let (ar, namespaced) = match find_api_resource(&discovery, &obj.gvk) {
            Ok(found) => found,
            Err(e) => {
                // kind no longer served (its CRD went first)
                debug!(object = %obj.describe(), error = %e, "skipping delete");
                continue;
            }
        };
        let api = dynamic_api(client, &ar, namespaced, obj)?;
        match api.delete(&obj.name, &DeleteParams::default()).await {
            Ok(_) => deleted += 1,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(anyhow!("delete of {} failed: {}", obj.describe(), e)),
        }
    }
    info!(deleted, ns = ?ns_override, "manifest deleted");
    Ok(deleted)
}
