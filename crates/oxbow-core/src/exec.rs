//! Exec configuration and results
//!
//! An [`ExecConfig`] describes one unit of work to run on a worker: a
//! container image, a command, and resource-tagged arguments. The scheduler
//! treats the config as opaque except for its kind, resources, and argument
//! filesets.

use crate::error::Error;
use crate::fileset::Fileset;
use crate::resources::Resources;
use serde::{Deserialize, Serialize};

/// The kind of an exec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecKind {
    /// Run a command in a container.
    #[default]
    Exec,
    /// Export a fileset to an external URL.
    Extern,
    /// Import external data into the cluster.
    Intern,
}

/// An argument to an exec: a fileset dependency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Arg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fileset: Option<Fileset>,
}

impl Arg {
    pub fn fileset(fs: Fileset) -> Self {
        Self { fileset: Some(fs) }
    }
}

/// Configuration for a single exec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecConfig {
    pub kind: ExecKind,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<Arg>,
    pub resources: Resources,
    /// Destination URL for extern execs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// The result of an exec: an output fileset, or an error.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub fileset: Fileset,
    pub err: Option<Error>,
}

impl ExecResult {
    pub fn ok(fileset: Fileset) -> Self {
        Self { fileset, err: None }
    }

    pub fn error(err: Error) -> Self {
        Self { fileset: Fileset::new(), err: Some(err) }
    }
}
