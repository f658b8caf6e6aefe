//! Turns raw discovery listings for one server into connection descriptors.
//!
//! Output order is specs first (listing order), then running kernels
//! (listing order). Duplicate ids keep the first occurrence.

use crate::model::{
    ConnectionDescriptor, KernelSpecDescriptor, LiveConnection, RunningKernelInfo,
    RunningSessionInfo, ServerIdentity, SpecConnection,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryListing {
    #[serde(default)]
    pub specs: Vec<KernelSpecDescriptor>,
    #[serde(default)]
    pub kernels: Vec<RunningKernelInfo>,
    #[serde(default)]
    pub sessions: Vec<RunningSessionInfo>,
}

impl DiscoveryListing {
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty() && self.kernels.is_empty() && self.sessions.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionBuildReport {
    pub connections: Vec<ConnectionDescriptor>,
    pub duplicate_ids: usize,
    pub invalid_entries: usize,
    pub orphaned_sessions: usize,
}

impl ConnectionBuildReport {
    pub fn ids(&self) -> Vec<&str> {
        self.connections.iter().map(|conn| conn.id()).collect()
    }
}

pub fn build_connections(
    server: &ServerIdentity,
    listing: &DiscoveryListing,
) -> ConnectionBuildReport {
    let mut report = ConnectionBuildReport::default();
    let mut seen = HashSet::new();

    for spec in &listing.specs {
        match SpecConnection::new(server.clone(), spec.clone()) {
            Ok(conn) => push_unique(&mut report, &mut seen, conn.into()),
            Err(_) => report.invalid_entries += 1,
        }
    }

    // First session wins when several wrap the same kernel.
    let mut session_by_kernel: HashMap<&str, &RunningSessionInfo> = HashMap::new();
    for session in &listing.sessions {
        session_by_kernel
            .entry(session.kernel.id.as_str())
            .or_insert(session);
    }

    let running_ids = listing
        .kernels
        .iter()
        .map(|kernel| kernel.id.as_str())
        .collect::<HashSet<_>>();
    report.orphaned_sessions = listing
        .sessions
        .iter()
        .filter(|session| !running_ids.contains(session.kernel.id.as_str()))
        .count();

    for kernel in &listing.kernels {
        let session = session_by_kernel.get(kernel.id.as_str()).map(|s| (*s).clone());
        match LiveConnection::new(server.clone(), kernel.clone(), session) {
            Ok(conn) => push_unique(&mut report, &mut seen, conn.into()),
            Err(_) => report.invalid_entries += 1,
        }
    }

    report
}

fn push_unique(
    report: &mut ConnectionBuildReport,
    seen: &mut HashSet<String>,
    descriptor: ConnectionDescriptor,
) {
    if seen.insert(descriptor.id().to_string()) {
        report.connections.push(descriptor);
    } else {
        report.duplicate_ids += 1;
    }
}
