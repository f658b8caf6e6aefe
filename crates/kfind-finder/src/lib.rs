pub mod collaborators;
pub mod config;
pub mod finder;
pub mod registry;

pub use collaborators::{
    CacheValidator, DiscoveryBackedValidator, DiscoveryError, DiscoverySource,
    RemoteDiscoveryClient, ServerIdentityProvider, ValidationError, WatchServerIdentity,
};
pub use config::{ConfigError, FinderConfig, DEFAULT_CACHE_KEY};
pub use finder::{
    CycleHandle, CycleOutcome, FinderCollaborators, FinderError, FinderState, RefreshReport,
    RemoteKernelFinder,
};
pub use registry::{FinderId, KernelRegistry, RegistryChange, RegistryError, RegistryWriteReport};
