use crate::identity::{connection_id, IdentityFields};
use crate::ContractError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity {
    server_id: String,
    base_url: String,
}

impl ServerIdentity {
    pub fn new(
        server_id: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ContractError> {
        let server_id = server_id.into().trim().to_string();
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if server_id.is_empty() {
            return Err(ContractError::EmptyField { field: "server_id" });
        }
        if base_url.is_empty() {
            return Err(ContractError::EmptyField { field: "base_url" });
        }
        Ok(Self {
            server_id,
            base_url,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.server_id, self.base_url)
    }
}

/// A kernel type the server knows how to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecDescriptor {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub executable: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningKernelInfo {
    pub id: String,
    pub name: String,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub connections: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKernelRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningSessionInfo {
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub session_type: String,
    pub kernel: SessionKernelRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Spec,
    Live,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Spec => "spec",
            ConnectionKind::Live => "live",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecConnection {
    id: String,
    server: ServerIdentity,
    spec: KernelSpecDescriptor,
}

impl SpecConnection {
    pub fn new(server: ServerIdentity, spec: KernelSpecDescriptor) -> Result<Self, ContractError> {
        if spec.name.trim().is_empty() {
            return Err(ContractError::EmptyField {
                field: "kernel_spec.name",
            });
        }
        let id = connection_id(
            &server,
            IdentityFields::Spec {
                name: &spec.name,
                executable: &spec.executable,
                argv: &spec.argv,
            },
        );
        Ok(Self { id, server, spec })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server(&self) -> &ServerIdentity {
        &self.server
    }

    pub fn spec(&self) -> &KernelSpecDescriptor {
        &self.spec
    }
}

/// A running kernel, optionally enriched with the session wrapping it.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConnection {
    id: String,
    server: ServerIdentity,
    kernel: RunningKernelInfo,
    session: Option<RunningSessionInfo>,
}

impl LiveConnection {
    pub fn new(
        server: ServerIdentity,
        kernel: RunningKernelInfo,
        session: Option<RunningSessionInfo>,
    ) -> Result<Self, ContractError> {
        if kernel.id.trim().is_empty() {
            return Err(ContractError::EmptyField { field: "kernel.id" });
        }
        let session = session.filter(|session| session.kernel.id == kernel.id);
        let id = connection_id(&server, IdentityFields::Live { kernel_id: &kernel.id });
        Ok(Self {
            id,
            server,
            kernel,
            session,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server(&self) -> &ServerIdentity {
        &self.server
    }

    pub fn kernel(&self) -> &RunningKernelInfo {
        &self.kernel
    }

    pub fn session(&self) -> Option<&RunningSessionInfo> {
        self.session.as_ref()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.kernel.last_activity
    }

    pub fn connections(&self) -> u32 {
        self.kernel.connections
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredConnection", into = "StoredConnection")]
pub enum ConnectionDescriptor {
    Spec(SpecConnection),
    Live(LiveConnection),
}

impl ConnectionDescriptor {
    pub fn id(&self) -> &str {
        match self {
            ConnectionDescriptor::Spec(conn) => conn.id(),
            ConnectionDescriptor::Live(conn) => conn.id(),
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        match self {
            ConnectionDescriptor::Spec(_) => ConnectionKind::Spec,
            ConnectionDescriptor::Live(_) => ConnectionKind::Live,
        }
    }

    pub fn server(&self) -> &ServerIdentity {
        match self {
            ConnectionDescriptor::Spec(conn) => conn.server(),
            ConnectionDescriptor::Live(conn) => conn.server(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionDescriptor::Live(_))
    }

    pub fn display_name(&self) -> &str {
        match self {
            ConnectionDescriptor::Spec(conn) => {
                if conn.spec.display_name.is_empty() {
                    &conn.spec.name
                } else {
                    &conn.spec.display_name
                }
            }
            ConnectionDescriptor::Live(conn) => match conn.session() {
                Some(session) if !session.name.is_empty() => &session.name,
                Some(session) if !session.path.is_empty() => &session.path,
                _ => &conn.kernel.name,
            },
        }
    }
}

impl From<SpecConnection> for ConnectionDescriptor {
    fn from(conn: SpecConnection) -> Self {
        ConnectionDescriptor::Spec(conn)
    }
}

impl From<LiveConnection> for ConnectionDescriptor {
    fn from(conn: LiveConnection) -> Self {
        ConnectionDescriptor::Live(conn)
    }
}

// Persisted shape. The id is written for readability and recomputed on load.
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredConnection {
    Spec {
        #[serde(default)]
        id: String,
        server: ServerIdentity,
        spec: KernelSpecDescriptor,
    },
    Live {
        #[serde(default)]
        id: String,
        server: ServerIdentity,
        kernel: RunningKernelInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<RunningSessionInfo>,
    },
}

impl TryFrom<StoredConnection> for ConnectionDescriptor {
    type Error = ContractError;

    fn try_from(stored: StoredConnection) -> Result<Self, Self::Error> {
        match stored {
            StoredConnection::Spec { server, spec, .. } => {
                let server = ServerIdentity::new(server.server_id, server.base_url)?;
                Ok(SpecConnection::new(server, spec)?.into())
            }
            StoredConnection::Live {
                server,
                kernel,
                session,
                ..
            } => {
                let server = ServerIdentity::new(server.server_id, server.base_url)?;
                Ok(LiveConnection::new(server, kernel, session)?.into())
            }
        }
    }
}

impl From<ConnectionDescriptor> for StoredConnection {
    fn from(descriptor: ConnectionDescriptor) -> Self {
        match descriptor {
            ConnectionDescriptor::Spec(conn) => StoredConnection::Spec {
                id: conn.id,
                server: conn.server,
                spec: conn.spec,
            },
            ConnectionDescriptor::Live(conn) => StoredConnection::Live {
                id: conn.id,
                server: conn.server,
                kernel: conn.kernel,
                session: conn.session,
            },
        }
    }
}
