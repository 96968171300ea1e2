//! Live discovery of node facts
//!
//! Facts (hostname, disks, links, addresses, routes, resolvers, hardware)
//! are read lazily from a node through a [`NodeApi`] transport and cached per
//! render. Offline renders use [`OfflineNodeApi`], which refuses every read.

mod api;
mod client;
pub mod facts;
mod pool;
mod talosctl;

pub use api::{NodeApi, OfflineNodeApi, ResourceItem, ResourceKind, StaticNodeApi};
pub use client::{
    BlockingFacts, DiscoveryClient, FactSource, UnboundFacts, DEFAULT_DEADLINE, FACT_NAMES,
};
pub use facts::{
    Address, DefaultRoute, Disk, Interface, Memory, NodeFacts, Processor, Route, DEFAULT_RESOLVERS,
};
pub use pool::ClientPool;
pub use talosctl::{parse_resource_stream, TalosctlApi};

use thiserror::Error;

use crate::error::{Classify, ErrorKind};

/// Errors from reading node resources. Each names the resource involved.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("{resource} is unavailable: {reason}")]
    Unavailable { resource: String, reason: String },

    #[error("timed out reading {resource}")]
    Timeout { resource: String },

    #[error("cancelled while reading {resource}")]
    Cancelled { resource: String },

    #[error("{resource} needs a live node but rendering is offline")]
    OfflineFactRequired { resource: String },
}

impl DiscoveryError {
    pub fn resource(&self) -> &str {
        match self {
            Self::Unavailable { resource, .. }
            | Self::Timeout { resource }
            | Self::Cancelled { resource }
            | Self::OfflineFactRequired { resource } => resource,
        }
    }
}

impl Classify for DiscoveryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable { .. } => ErrorKind::DiscoveryUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::OfflineFactRequired { .. } => ErrorKind::OfflineFactRequired,
        }
    }
}
