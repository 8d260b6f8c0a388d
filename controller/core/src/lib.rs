#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Domain types shared by the functions controller, its gRPC server, and the
//! CLI client: logical function definitions, scopes, size tiers, the naming
//! scheme, and the error taxonomy surfaced over the RPC boundary.

mod name;

pub use self::name::{fingerprint, obfuscate_user, sanitize_label, ServiceIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical, immutable function description.
///
/// Two equal definitions denote the same function: the cluster object name is
/// derived deterministically from these fields alone.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FunctionDefinition {
    /// Namespace identifier.
    pub namespace: String,
    /// Human-readable namespace name.
    pub namespace_name: String,
    /// Workflow identifier; empty for namespace-scoped functions.
    pub workflow: String,
    /// Workflow path within the namespace.
    pub path: String,
    /// Logical function name.
    pub name: String,
    /// Container image.
    pub image: String,
    /// Command, parsed with POSIX shell word splitting before use.
    pub cmd: String,
    /// Resource tier.
    pub size: Size,
    /// Minimum replica count; clamped to the cluster-wide maximum.
    pub min_scale: i32,
    /// Environment variables. Ordering is significant.
    pub envs: Vec<(String, String)>,
}

/// Determines how a service name is derived and which selectors apply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Workflow,
    Namespace,
    Global,
    Service,
}

/// A resource tier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Size {
    Small,
    Medium,
    Large,
}

/// Errors surfaced over the RPC boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("namespace {0} is at its max-jobs limit")]
    MaxJobsExceeded(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// === impl FunctionDefinition ===

impl FunctionDefinition {
    /// Validates the parts of a definition that naming and object building
    /// rely on.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Invalid("function name must not be empty".into()));
        }
        if self.image.is_empty() {
            return Err(Error::Invalid("function image must not be empty".into()));
        }
        if self.namespace.is_empty() && self.namespace_name.is_empty() {
            return Err(Error::Invalid("function namespace must not be empty".into()));
        }
        if self.min_scale < 0 {
            return Err(Error::Invalid(format!(
                "min-scale must not be negative: {}",
                self.min_scale
            )));
        }
        Ok(())
    }
}

// === impl Scope ===

impl Scope {
    /// The label value written to cluster objects.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Workflow => "w",
            Scope::Namespace => "ns",
            Scope::Global => "g",
            Scope::Service => "s",
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "w" | "workflow" => Ok(Scope::Workflow),
            "ns" | "namespace" => Ok(Scope::Namespace),
            "g" | "global" => Ok(Scope::Global),
            "s" | "service" => Ok(Scope::Service),
            s => Err(Error::Invalid(format!("unknown scope: {}", s))),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Size ===

impl Size {
    pub fn as_i32(&self) -> i32 {
        match self {
            Size::Small => 0,
            Size::Medium => 1,
            Size::Large => 2,
        }
    }

    /// Out-of-range values fall back to the smallest tier.
    pub fn from_i32(size: i32) -> Self {
        match size {
            1 => Size::Medium,
            2 => Size::Large,
            _ => Size::Small,
        }
    }
}

impl Default for Size {
    fn default() -> Self {
        Size::Small
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Size::Small => "small".fmt(f),
            Size::Medium => "medium".fmt(f),
            Size::Large => "large".fmt(f),
        }
    }
}
