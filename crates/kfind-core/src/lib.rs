pub mod builder;
pub mod identity;
pub mod model;
pub mod snapshot;

use thiserror::Error;

pub use builder::{build_connections, ConnectionBuildReport, DiscoveryListing};
pub use identity::{connection_id, IdentityFields};
pub use model::{
    ConnectionDescriptor, ConnectionKind, KernelSpecDescriptor, LiveConnection,
    RunningKernelInfo, RunningSessionInfo, ServerIdentity, SessionKernelRef, SpecConnection,
};
pub use snapshot::{CacheSlot, CacheSnapshot};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("{field} cannot be empty")]
    EmptyField { field: &'static str },
    #[error("serialization failed: {0}")]
    Serialization(String),
}
