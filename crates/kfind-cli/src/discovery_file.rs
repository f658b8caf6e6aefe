use async_trait::async_trait;
use kfind_core::{KernelSpecDescriptor, RunningKernelInfo, RunningSessionInfo, ServerIdentity};
use kfind_finder::{DiscoveryError, RemoteDiscoveryClient};
use serde::Deserialize;
use std::path::PathBuf;

/// Snapshot of a server's listings as written by an external exporter.
#[derive(Debug, Default, Deserialize)]
struct DiscoveryDocument {
    #[serde(default)]
    kernelspecs: Option<Vec<KernelSpecDescriptor>>,
    #[serde(default)]
    kernels: Option<Vec<RunningKernelInfo>>,
    #[serde(default)]
    sessions: Option<Vec<RunningSessionInfo>>,
}

/// Serves discovery from a JSON file that is re-read on every call, so edits
/// show up on the next refresh. A missing section fails that listing only.
pub struct FileDiscoveryClient {
    path: PathBuf,
}

impl FileDiscoveryClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self, server: &ServerIdentity) -> Result<DiscoveryDocument, DiscoveryError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            DiscoveryError::Unreachable(format!("{server}: {}: {err}", self.path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| DiscoveryError::InvalidResponse(err.to_string()))
    }
}

fn section<T>(value: Option<Vec<T>>, name: &str) -> Result<Vec<T>, DiscoveryError> {
    value.ok_or_else(|| DiscoveryError::Request(format!("listing '{name}' unavailable")))
}

#[async_trait]
impl RemoteDiscoveryClient for FileDiscoveryClient {
    async fn list_kernel_specs(
        &self,
        server: &ServerIdentity,
    ) -> Result<Vec<KernelSpecDescriptor>, DiscoveryError> {
        section(self.read(server).await?.kernelspecs, "kernelspecs")
    }

    async fn list_running_kernels(
        &self,
        server: &ServerIdentity,
    ) -> Result<Vec<RunningKernelInfo>, DiscoveryError> {
        section(self.read(server).await?.kernels, "kernels")
    }

    async fn list_running_sessions(
        &self,
        server: &ServerIdentity,
    ) -> Result<Vec<RunningSessionInfo>, DiscoveryError> {
        section(self.read(server).await?.sessions, "sessions")
    }
}
