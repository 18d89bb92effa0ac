//! # libecfs — CSI plugin for ECFS network filesystem volumes
//!
//! `libecfs` implements the Identity, Controller and Node services of a
//! [Container Storage Interface][csi] plugin that provisions NFS volumes on an
//! ECFS cluster through its management REST API and mounts them on worker
//! nodes.  Requests travel as JSON envelopes over QUIC (via [`quinn`]).
//!
//! Every lifecycle operation is idempotent: retried creates converge on the
//! existing resource, deletes of absent resources succeed, and mounts that are
//! already in place are left alone.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: volumes, snapshots, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum and the status codes reported to callers. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait and the ECFS controller. |
//! | [`node`] | [`CsiNode`] trait and the NFS node service. |
//! | [`plugin`] | Composes the services for the configured role. |
//! | [`backend`] | Storage-management backends (REST, in-memory). |
//! | [`session`] | Single-flight, lazily established backend session. |
//! | [`params`] | Storage class parameter parsing. |
//! | [`snapshot`] | Snapshot naming policy and record translation. |
//! | [`mount`] | Idempotent local mount primitives. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod controller;
pub mod error;
pub mod identity;
pub mod message;
pub mod mount;
pub mod node;
pub mod params;
pub mod plugin;
pub mod session;
pub mod snapshot;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_util;

// Re-export the most commonly used items at crate root for convenience.
pub use controller::{ControllerConfig, ControllerServer, CsiController};
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::{CsiNode, NodeServer};
pub use plugin::Plugin;
pub use session::Session;
pub use types::*;
