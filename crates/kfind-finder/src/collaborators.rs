use async_trait::async_trait;
use kfind_core::{
    ConnectionDescriptor, KernelSpecDescriptor, RunningKernelInfo, RunningSessionInfo,
    ServerIdentity, SpecConnection,
};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiscoverySource {
    KernelSpecs,
    RunningKernels,
    RunningSessions,
}

impl DiscoverySource {
    pub const ALL: [DiscoverySource; 3] = [
        DiscoverySource::KernelSpecs,
        DiscoverySource::RunningKernels,
        DiscoverySource::RunningSessions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoverySource::KernelSpecs => "kernel_specs",
            DiscoverySource::RunningKernels => "running_kernels",
            DiscoverySource::RunningSessions => "running_sessions",
        }
    }
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Lists what a remote server currently offers. Each call may fail on its own.
#[async_trait]
pub trait RemoteDiscoveryClient: Send + Sync {
    async fn list_kernel_specs(
        &self,
        server: &ServerIdentity,
    ) -> Result<Vec<KernelSpecDescriptor>, DiscoveryError>;

    async fn list_running_kernels(
        &self,
        server: &ServerIdentity,
    ) -> Result<Vec<RunningKernelInfo>, DiscoveryError>;

    async fn list_running_sessions(
        &self,
        server: &ServerIdentity,
    ) -> Result<Vec<RunningSessionInfo>, DiscoveryError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("discovery failed during validation: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("validation failed: {0}")]
    Other(String),
}

/// Decides whether a cached descriptor may be reused. `Ok(false)` and any
/// error both discard the entry.
#[async_trait]
pub trait CacheValidator: Send + Sync {
    async fn is_valid(&self, descriptor: &ConnectionDescriptor) -> Result<bool, ValidationError>;
}

pub trait ServerIdentityProvider: Send + Sync {
    fn current(&self) -> Option<ServerIdentity>;
    fn watch(&self) -> watch::Receiver<Option<ServerIdentity>>;
}

pub struct WatchServerIdentity {
    tx: watch::Sender<Option<ServerIdentity>>,
}

impl WatchServerIdentity {
    pub fn new(initial: Option<ServerIdentity>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn fixed(server: ServerIdentity) -> Self {
        Self::new(Some(server))
    }

    /// Returns whether the identity actually changed.
    pub fn set(&self, server: Option<ServerIdentity>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == server {
                return false;
            }
            *current = server;
            true
        })
    }
}

impl ServerIdentityProvider for WatchServerIdentity {
    fn current(&self) -> Option<ServerIdentity> {
        self.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<ServerIdentity>> {
        self.tx.subscribe()
    }
}

/// Validates cached entries against the live server listing: a live kernel
/// must still be running, a spec must still be offered with the same identity.
pub struct DiscoveryBackedValidator {
    client: Arc<dyn RemoteDiscoveryClient>,
}

impl DiscoveryBackedValidator {
    pub fn new(client: Arc<dyn RemoteDiscoveryClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CacheValidator for DiscoveryBackedValidator {
    async fn is_valid(&self, descriptor: &ConnectionDescriptor) -> Result<bool, ValidationError> {
        match descriptor {
            ConnectionDescriptor::Live(live) => {
                let kernels = self.client.list_running_kernels(live.server()).await?;
                Ok(kernels.iter().any(|kernel| kernel.id == live.kernel().id))
            }
            ConnectionDescriptor::Spec(spec) => {
                let specs = self.client.list_kernel_specs(spec.server()).await?;
                Ok(specs.into_iter().any(|candidate| {
                    SpecConnection::new(spec.server().clone(), candidate)
                        .map(|conn| conn.id() == spec.id())
                        .unwrap_or(false)
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kfind_core::LiveConnection;

    struct FixedListing {
        specs: Result<Vec<KernelSpecDescriptor>, DiscoveryError>,
        kernels: Vec<RunningKernelInfo>,
    }

    #[async_trait]
    impl RemoteDiscoveryClient for FixedListing {
        async fn list_kernel_specs(
            &self,
            _server: &ServerIdentity,
        ) -> Result<Vec<KernelSpecDescriptor>, DiscoveryError> {
            self.specs.clone()
        }

        async fn list_running_kernels(
            &self,
            _server: &ServerIdentity,
        ) -> Result<Vec<RunningKernelInfo>, DiscoveryError> {
            Ok(self.kernels.clone())
        }

        async fn list_running_sessions(
            &self,
            _server: &ServerIdentity,
        ) -> Result<Vec<RunningSessionInfo>, DiscoveryError> {
            Ok(Vec::new())
        }
    }

    fn server() -> ServerIdentity {
        ServerIdentity::new("remote-1", "http://localhost:8888").expect("server")
    }

    fn python_spec(argv0: &str) -> KernelSpecDescriptor {
        KernelSpecDescriptor {
            name: "python3".to_string(),
            display_name: "Python 3".to_string(),
            argv: vec![argv0.to_string(), "-m".to_string(), "ipykernel".to_string()],
            language: "python".to_string(),
            executable: argv0.to_string(),
            metadata: Default::default(),
        }
    }

    fn kernel(id: &str) -> RunningKernelInfo {
        RunningKernelInfo {
            id: id.to_string(),
            name: "python3".to_string(),
            last_activity: Utc
                .with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
                .single()
                .expect("valid timestamp"),
            connections: 1,
            execution_state: None,
        }
    }

    #[test]
    fn watch_identity_reports_only_real_changes() {
        let provider = WatchServerIdentity::fixed(server());
        assert!(!provider.set(Some(server())));
        let other = ServerIdentity::new("remote-2", "http://other:8888").expect("server");
        assert!(provider.set(Some(other.clone())));
        assert_eq!(provider.current(), Some(other));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_entries_are_valid_while_kernel_runs() {
        let client = Arc::new(FixedListing {
            specs: Ok(Vec::new()),
            kernels: vec![kernel("k1")],
        });
        let validator = DiscoveryBackedValidator::new(client);

        let running: ConnectionDescriptor = LiveConnection::new(server(), kernel("k1"), None)
            .expect("live")
            .into();
        let gone: ConnectionDescriptor = LiveConnection::new(server(), kernel("k2"), None)
            .expect("live")
            .into();
        assert!(validator.is_valid(&running).await.expect("validate"));
        assert!(!validator.is_valid(&gone).await.expect("validate"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spec_entries_require_matching_identity() {
        let client = Arc::new(FixedListing {
            specs: Ok(vec![python_spec("python")]),
            kernels: Vec::new(),
        });
        let validator = DiscoveryBackedValidator::new(client);

        let same: ConnectionDescriptor = SpecConnection::new(server(), python_spec("python"))
            .expect("spec")
            .into();
        let upgraded: ConnectionDescriptor =
            SpecConnection::new(server(), python_spec("/opt/conda/bin/python"))
                .expect("spec")
                .into();
        assert!(validator.is_valid(&same).await.expect("validate"));
        assert!(!validator.is_valid(&upgraded).await.expect("validate"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listing_failures_surface_as_errors() {
        let client = Arc::new(FixedListing {
            specs: Err(DiscoveryError::Unreachable("connection refused".to_string())),
            kernels: Vec::new(),
        });
        let validator = DiscoveryBackedValidator::new(client);
        let spec: ConnectionDescriptor = SpecConnection::new(server(), python_spec("python"))
            .expect("spec")
            .into();
        let err = validator.is_valid(&spec).await.expect_err("should fail");
        assert!(matches!(err, ValidationError::Discovery(_)));
    }
}
