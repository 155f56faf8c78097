//! Kiln deploy: the installable platform units and the orchestrator that sequences them.

#![forbid(unsafe_code)]

use kiln_core::{InstallationOption, KilnResult, OptionSet};

mod common;
pub mod orchestrator;
pub mod unit;
pub mod units;

pub use common::ManifestUnit;
pub use orchestrator::{Orchestrator, UnitSummary, SYSTEM_DOMAIN};
pub use unit::{render, DeploymentUnit, DirManifests, InstallContext, ManifestSource, StaticManifests};
pub use units::{standard_units, CertManager, Gitea, GiteaConfig, Tekton, Unit, Workloads, WorkloadsConfig};

/// Every option the standard units read, unset.
pub fn default_options() -> KilnResult<OptionSet> {
    let mut opts = vec![InstallationOption::string(
        SYSTEM_DOMAIN,
        "Domain the platform is reachable under; derived from the ingress address when empty",
    )];
    opts.extend(Workloads::options());
    opts.extend(Gitea::options());
    OptionSet::from_options(opts)
}
