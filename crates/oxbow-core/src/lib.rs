//! Oxbow core - shared vocabulary for the cluster manager and scheduler
//!
//! This crate defines the types every other oxbow crate speaks:
//!
//! - [`Resources`] and [`Requirements`] (resource vectors and aggregate demand)
//! - the [`Error`]/[`ErrorKind`] taxonomy that all component boundaries
//!   translate into
//! - content-addressed [`Digest`]s, [`File`]s and [`Fileset`]s
//! - the [`Repository`] and blob [`Mux`] capabilities
//! - retry policies and rate/batch limiters used by everything that talks
//!   to the cloud provider

pub mod blob;
pub mod digest;
pub mod error;
pub mod exec;
pub mod fileset;
pub mod limiter;
pub mod repository;
pub mod resources;
pub mod retry;

pub use digest::Digest;
pub use error::{Error, ErrorKind, Result};
pub use exec::{Arg, ExecConfig, ExecKind, ExecResult};
pub use fileset::{File, Fileset};
pub use repository::{BlobLocator, InmemoryRepository, Repository};
pub use resources::{Requirements, Resources};
