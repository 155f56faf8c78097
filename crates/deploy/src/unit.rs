//! The lifecycle contract every installable subsystem implements.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::{KilnError, KilnResult, ScopedOptions, Timeouts};
use kiln_kubehub::ClusterOps;

/// Where unit manifests come from. Their contents are opaque to Kiln apart from `{{var}}` holes.
pub trait ManifestSource: Send + Sync {
    fn load(&self, name: &str) -> KilnResult<String>;
}

/// Manifests read from `<root>/<name>`.
#[derive(Debug, Clone)]
pub struct DirManifests {
    root: PathBuf,
}

impl DirManifests {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ManifestSource for DirManifests {
    fn load(&self, name: &str) -> KilnResult<String> {
        let path = self.root.join(name);
        std::fs::read_to_string(&path).map_err(|e| KilnError::Io(format!("{}: {}", path.display(), e)))
    }
}

/// In-memory manifests keyed by file name.
#[derive(Debug, Clone, Default)]
pub struct StaticManifests {
    files: BTreeMap<String, String>,
}

impl StaticManifests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, yaml: &str) -> Self {
        self.files.insert(name.to_string(), yaml.to_string());
        self
    }
}

impl ManifestSource for StaticManifests {
    fn load(&self, name: &str) -> KilnResult<String> {
        self.files.get(name).cloned().ok_or_else(|| KilnError::NotFound(format!("manifest {}", name)))
    }
}

/// Fill `{{name}}` holes. Unknown holes are left as they are.
pub fn render(template: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        out = out.replace(&format!("{{{{{}}}}}", k), v);
    }
    out
}

/// Shared, read-only state handed to every unit call.
#[derive(Clone)]
pub struct InstallContext {
    pub manifests: Arc<dyn ManifestSource>,
    pub timeouts: Timeouts,
    /// Resolved system domain. `None` until configured or discovered.
    pub system_domain: Option<String>,
}

impl InstallContext {
    pub fn new(manifests: Arc<dyn ManifestSource>, timeouts: Timeouts) -> Self {
        Self { manifests, timeouts, system_domain: None }
    }

    /// The system domain, or a validation error naming the unit that needed it.
    pub fn require_domain(&self, unit: &str) -> KilnResult<&str> {
        match self.system_domain.as_deref() {
            Some(d) if !d.is_empty() => Ok(d),
            _ => Err(KilnError::validation(format!(
                "{} needs a system domain; pass one explicitly or make sure the ingress gets an external IP",
                unit
            ))),
        }
    }
}

/// One installable subsystem.
///
/// Units keep no state between calls: whether they are installed is read from the cluster each
/// time. Operations that do not apply to a unit succeed without acting.
#[async_trait::async_trait]
pub trait DeploymentUnit: Send + Sync {
    /// Stable identifier, also the option prefix.
    fn id(&self) -> &str;
    fn describe(&self) -> String;
    fn version(&self) -> &str;

    /// Name of the service whose load-balancer address defines the system domain.
    fn ingress_service(&self) -> Option<&str> {
        None
    }

    /// `AlreadyPresent` when the primary namespace exists. Returns once the workload runs.
    async fn deploy(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, options: ScopedOptions<'_>) -> KilnResult<()>;

    async fn upgrade(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, options: ScopedOptions<'_>) -> KilnResult<()>;

    /// Succeeds without acting when the primary namespace is missing or not Kiln-owned.
    async fn delete(&self, cluster: &dyn ClusterOps, ctx: &InstallContext) -> KilnResult<()>;

    async fn backup(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, dir: &Path) -> KilnResult<()>;

    async fn restore(&self, cluster: &dyn ClusterOps, ctx: &InstallContext, dir: &Path) -> KilnResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_known_holes() {
        let mut vars = BTreeMap::new();
        vars.insert("system_domain", "10.0.0.1.nip.io".to_string());
        let out = render("host: gitea.{{system_domain}}\nother: {{unknown}}\n", &vars);
        assert_eq!(out, "host: gitea.10.0.0.1.nip.io\nother: {{unknown}}\n");
    }

    #[test]
    fn missing_domain_is_a_validation_error() {
        let mut ctx = InstallContext::new(Arc::new(StaticManifests::new()), Timeouts::default());
        assert!(matches!(ctx.require_domain("gitea"), Err(KilnError::Validation(_))));
        ctx.system_domain = Some(String::new());
        assert!(ctx.require_domain("gitea").is_err());
        ctx.system_domain = Some("example.org".into());
        assert_eq!(ctx.require_domain("gitea").unwrap(), "example.org");
    }

    #[test]
    fn static_manifests_report_missing_files() {
        let m = StaticManifests::new().with("a.yaml", "x: 1");
        assert_eq!(m.load("a.yaml").unwrap(), "x: 1");
        assert!(m.load("b.yaml").unwrap_err().is_not_found());
    }
}
