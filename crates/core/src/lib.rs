//! Kiln core types: errors, ownership constants, installation options and runtime config.

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod options;

pub use config::Timeouts;
pub use options::{
    DefaultRule, DefaultSource, FlagSource, InstallationOption, InteractiveSource, OptionKind, OptionOrigin, OptionSet,
    OptionSource, OptionValue, ScopedOptions,
};

/// Label key written on every namespace Kiln creates.
pub const OWNERSHIP_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
/// Label value paired with [`OWNERSHIP_LABEL_KEY`].
pub const OWNERSHIP_LABEL_VALUE: &str = "kiln";

/// Suffix of the wildcard DNS service used for synthesized system domains.
pub const DEFAULT_DOMAIN_SUFFIX: &str = "nip.io";

/// Build the default system domain for an externally reachable IP.
pub fn synthesize_domain(ip: &str) -> String {
    format!("{}.{}", ip, DEFAULT_DOMAIN_SUFFIX)
}

/// True when a label map carries the Kiln ownership marker.
pub fn is_owned<'a, I>(labels: I) -> bool
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    labels.into_iter().any(|(k, v)| k == OWNERSHIP_LABEL_KEY && v == OWNERSHIP_LABEL_VALUE)
}

/// Errors surfaced by every Kiln layer. Carried verbatim up to the orchestrator.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum KilnError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("already present: {0}")]
    AlreadyPresent(String),
    #[error("not owned by kiln: {0}")]
    NotOwned(String),
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("remote api: {0}")]
    Remote(String),
    #[error("io: {0}")]
    Io(String),
}

impl KilnError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for KilnError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(format!("json: {}", e))
    }
}

pub type KilnResult<T> = Result<T, KilnError>;

pub mod prelude {
    pub use super::{KilnError, KilnResult, OptionSet, ScopedOptions, OWNERSHIP_LABEL_KEY, OWNERSHIP_LABEL_VALUE};
}
