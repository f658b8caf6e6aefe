//! Shared, observable set of connection descriptors across all finders.
//!
//! Each id belongs to the finder that first published it. A batch write
//! produces at most one [`RegistryChange`]; batches that change nothing are
//! silent.

use kfind_core::ConnectionDescriptor;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FinderId(String);

impl FinderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FinderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("finder {0} was released from the registry")]
    OwnerReleased(FinderId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryChange {
    pub seq: u64,
    pub owner: FinderId,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryWriteReport {
    pub change: Option<RegistryChange>,
    pub conflicts: Vec<String>,
}

struct RegistryEntry {
    owner: FinderId,
    descriptor: ConnectionDescriptor,
}

#[derive(Default)]
struct RegistryState {
    entries: BTreeMap<String, RegistryEntry>,
    released: HashSet<FinderId>,
    seq: u64,
}

#[derive(Default)]
struct PendingChange {
    added: Vec<String>,
    updated: Vec<String>,
    removed: Vec<String>,
    conflicts: Vec<String>,
}

impl PendingChange {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

pub struct KernelRegistry {
    state: RwLock<RegistryState>,
    changes: broadcast::Sender<RegistryChange>,
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(RegistryState::default()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<ConnectionDescriptor> {
        let state = self.state.read().await;
        state
            .entries
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub async fn snapshot_for(&self, owner: &FinderId) -> Vec<ConnectionDescriptor> {
        let state = self.state.read().await;
        state
            .entries
            .values()
            .filter(|entry| &entry.owner == owner)
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub async fn ids_for(&self, owner: &FinderId) -> BTreeSet<String> {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .filter(|(_, entry)| &entry.owner == owner)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<ConnectionDescriptor> {
        let state = self.state.read().await;
        state.entries.get(id).map(|entry| entry.descriptor.clone())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub async fn upsert_many(
        &self,
        owner: &FinderId,
        descriptors: Vec<ConnectionDescriptor>,
    ) -> Result<RegistryWriteReport, RegistryError> {
        let mut state = self.state.write().await;
        ensure_active(&state, owner)?;
        let mut pending = PendingChange::default();
        apply_upserts(&mut state, owner, descriptors, &mut pending);
        Ok(self.commit(&mut state, owner, pending))
    }

    pub async fn remove_all(
        &self,
        owner: &FinderId,
        ids: &[String],
    ) -> Result<RegistryWriteReport, RegistryError> {
        let mut state = self.state.write().await;
        ensure_active(&state, owner)?;
        let mut pending = PendingChange::default();
        apply_removals(&mut state, owner, ids.iter().cloned(), &mut pending);
        Ok(self.commit(&mut state, owner, pending))
    }

    /// Replaces everything `owner` contributes in one step.
    pub async fn replace_contribution(
        &self,
        owner: &FinderId,
        descriptors: Vec<ConnectionDescriptor>,
    ) -> Result<RegistryWriteReport, RegistryError> {
        let mut state = self.state.write().await;
        ensure_active(&state, owner)?;

        let keep = descriptors
            .iter()
            .map(|descriptor| descriptor.id().to_string())
            .collect::<HashSet<_>>();
        let stale = owned_ids(&state, owner)
            .into_iter()
            .filter(|id| !keep.contains(id))
            .collect::<Vec<_>>();

        let mut pending = PendingChange::default();
        apply_removals(&mut state, owner, stale.into_iter(), &mut pending);
        apply_upserts(&mut state, owner, descriptors, &mut pending);
        Ok(self.commit(&mut state, owner, pending))
    }

    /// Drops the owner's contribution and rejects its later writes.
    pub async fn release(&self, owner: &FinderId) -> RegistryWriteReport {
        let mut state = self.state.write().await;
        if !state.released.insert(owner.clone()) {
            return RegistryWriteReport::default();
        }
        let ids = owned_ids(&state, owner);
        let mut pending = PendingChange::default();
        apply_removals(&mut state, owner, ids.into_iter(), &mut pending);
        debug!(
            event = "kernel_registry_owner_released",
            finder = %owner,
            removed = pending.removed.len()
        );
        self.commit(&mut state, owner, pending)
    }

    fn commit(
        &self,
        state: &mut RegistryState,
        owner: &FinderId,
        pending: PendingChange,
    ) -> RegistryWriteReport {
        if !pending.conflicts.is_empty() {
            warn!(
                event = "kernel_registry_owner_conflict",
                finder = %owner,
                conflicts = pending.conflicts.len()
            );
        }
        if pending.is_empty() {
            return RegistryWriteReport {
                change: None,
                conflicts: pending.conflicts,
            };
        }

        state.seq += 1;
        let change = RegistryChange {
            seq: state.seq,
            owner: owner.clone(),
            added: pending.added,
            updated: pending.updated,
            removed: pending.removed,
        };
        // No subscribers is fine.
        let _ = self.changes.send(change.clone());
        RegistryWriteReport {
            change: Some(change),
            conflicts: pending.conflicts,
        }
    }
}

fn ensure_active(state: &RegistryState, owner: &FinderId) -> Result<(), RegistryError> {
    if state.released.contains(owner) {
        return Err(RegistryError::OwnerReleased(owner.clone()));
    }
    Ok(())
}

fn owned_ids(state: &RegistryState, owner: &FinderId) -> Vec<String> {
    state
        .entries
        .iter()
        .filter(|(_, entry)| &entry.owner == owner)
        .map(|(id, _)| id.clone())
        .collect()
}

fn owned_by(state: &RegistryState, id: &str, owner: &FinderId) -> Option<bool> {
    state.entries.get(id).map(|entry| &entry.owner == owner)
}

fn apply_upserts(
    state: &mut RegistryState,
    owner: &FinderId,
    descriptors: Vec<ConnectionDescriptor>,
    pending: &mut PendingChange,
) {
    let mut seen = HashSet::new();
    for descriptor in descriptors {
        let id = descriptor.id().to_string();
        if !seen.insert(id.clone()) {
            continue;
        }
        match owned_by(state, &id, owner) {
            Some(false) => pending.conflicts.push(id),
            Some(true) => {
                if let Some(entry) = state.entries.get_mut(&id) {
                    if entry.descriptor != descriptor {
                        entry.descriptor = descriptor;
                        pending.updated.push(id);
                    }
                }
            }
            None => {
                state.entries.insert(
                    id.clone(),
                    RegistryEntry {
                        owner: owner.clone(),
                        descriptor,
                    },
                );
                pending.added.push(id);
            }
        }
    }
}

fn apply_removals(
    state: &mut RegistryState,
    owner: &FinderId,
    ids: impl Iterator<Item = String>,
    pending: &mut PendingChange,
) {
    for id in ids {
        match owned_by(state, &id, owner) {
            Some(false) => pending.conflicts.push(id),
            Some(true) => {
                state.entries.remove(&id);
                pending.removed.push(id);
            }
            None => {}
        }
    }
}
