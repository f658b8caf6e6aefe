//! Refresh lifecycle for one remote server.
//!
//! A cycle loads the cached snapshot (on activation or identity change),
//! validates it, runs discovery, merges, publishes the merged set to the
//! registry in one write, then persists it. At most one cycle is in flight;
//! refresh requests arriving meanwhile attach to it.

use crate::collaborators::{
    CacheValidator, DiscoverySource, RemoteDiscoveryClient, ServerIdentityProvider,
};
use crate::config::FinderConfig;
use crate::registry::{FinderId, KernelRegistry, RegistryError};
use futures_util::stream::{FuturesUnordered, StreamExt};
use kfind_core::{
    build_connections, CacheSlot, CacheSnapshot, ConnectionDescriptor, DiscoveryListing,
    ServerIdentity,
};
use kfind_storage::CacheStore;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinderState {
    Idle,
    LoadingCache,
    CacheApplied,
    Refreshing,
    Refreshed,
    Disposed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FinderError {
    #[error("finder has not been activated")]
    NotActivated,
    #[error("finder was disposed")]
    Disposed,
    #[error("no server identity is available")]
    NoServer,
    #[error("server {server} unreachable: every discovery source failed")]
    ServerUnreachable { server: String },
    #[error("cycle task failed: {0}")]
    Internal(String),
}

impl From<RegistryError> for FinderError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::OwnerReleased(_) => FinderError::Disposed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub generation: u64,
    pub server: ServerIdentity,
    /// Size of the finder's published contribution.
    pub published: usize,
    /// Carried entries kept because this cycle's discovery did not supersede them.
    pub from_cache: usize,
    pub failed_sources: Vec<DiscoverySource>,
    pub persisted: bool,
}

pub type CycleOutcome = Result<RefreshReport, FinderError>;

/// Awaitable result of a cycle. Clones observe the same outcome.
#[derive(Debug, Clone)]
pub struct CycleHandle {
    generation: u64,
    outcome: watch::Receiver<Option<CycleOutcome>>,
}

impl CycleHandle {
    fn ready(generation: u64, outcome: CycleOutcome) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        Self {
            generation,
            outcome: rx,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A handle whose cycle task went away without an outcome also counts
    /// as finished.
    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some() || self.outcome.has_changed().is_err()
    }

    pub async fn outcome(mut self) -> CycleOutcome {
        loop {
            if let Some(outcome) = self.outcome.borrow().clone() {
                return outcome;
            }
            if self.outcome.changed().await.is_err() {
                return self
                    .outcome
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| Err(FinderError::Internal("cycle task dropped".to_string())));
            }
        }
    }
}

/// External collaborators a finder is wired with.
pub struct FinderCollaborators {
    pub discovery: Arc<dyn RemoteDiscoveryClient>,
    pub validator: Arc<dyn CacheValidator>,
    pub store: Arc<dyn CacheStore>,
    pub identity: Arc<dyn ServerIdentityProvider>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleMode {
    /// Load and validate the cache before discovery.
    Reload,
    Refresh,
}

#[derive(Default)]
struct Control {
    activated: bool,
    disposed: bool,
    generation: u64,
    in_flight: Option<CycleHandle>,
    tasks: Vec<JoinHandle<()>>,
}

/// Provisional entries carried between cycles for the current server:
/// cache-validated descriptors plus the specs of the last good spec listing.
#[derive(Default)]
struct CarriedCache {
    server: Option<ServerIdentity>,
    entries: Vec<ConnectionDescriptor>,
}

struct DiscoveryRound {
    listing: DiscoveryListing,
    failed: Vec<DiscoverySource>,
}

struct MergeOutcome {
    merged: Vec<ConnectionDescriptor>,
    from_cache: usize,
}

struct FinderInner {
    owner: FinderId,
    config: FinderConfig,
    registry: Arc<KernelRegistry>,
    discovery: Arc<dyn RemoteDiscoveryClient>,
    validator: Arc<dyn CacheValidator>,
    store: Arc<dyn CacheStore>,
    identity: Arc<dyn ServerIdentityProvider>,
    state: watch::Sender<FinderState>,
    shutdown: watch::Sender<bool>,
    control: Mutex<Control>,
    carried: AsyncMutex<CarriedCache>,
    persist_lock: AsyncMutex<()>,
}

pub struct RemoteKernelFinder {
    inner: Arc<FinderInner>,
}

impl RemoteKernelFinder {
    pub fn new(
        config: FinderConfig,
        registry: Arc<KernelRegistry>,
        collaborators: FinderCollaborators,
    ) -> Self {
        let (state, _) = watch::channel(FinderState::Idle);
        let (shutdown, _) = watch::channel(false);
        let inner = FinderInner {
            owner: FinderId::generate("remote"),
            config,
            registry,
            discovery: collaborators.discovery,
            validator: collaborators.validator,
            store: collaborators.store,
            identity: collaborators.identity,
            state,
            shutdown,
            control: Mutex::new(Control::default()),
            carried: AsyncMutex::new(CarriedCache::default()),
            persist_lock: AsyncMutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> &FinderId {
        &self.inner.owner
    }

    pub fn registry(&self) -> &Arc<KernelRegistry> {
        &self.inner.registry
    }

    pub fn state(&self) -> FinderState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<FinderState> {
        self.inner.state.subscribe()
    }

    /// This finder's current contribution to the registry.
    pub async fn kernels(&self) -> Vec<ConnectionDescriptor> {
        self.inner.registry.snapshot_for(&self.inner.owner).await
    }

    /// Starts the first cycle plus the identity watcher and refresh timer.
    /// Activating twice behaves like [`refresh`](Self::refresh).
    pub fn activate(&self) -> CycleHandle {
        {
            let mut control = self.inner.control();
            if control.disposed {
                return CycleHandle::ready(control.generation, Err(FinderError::Disposed));
            }
            if control.activated {
                drop(control);
                return self.inner.trigger(CycleMode::Refresh);
            }
            control.activated = true;
        }

        info!(event = "kernel_finder_activated", finder = %self.inner.owner);
        FinderInner::spawn_identity_watcher(&self.inner);
        FinderInner::spawn_refresh_timer(&self.inner);
        self.inner.trigger(CycleMode::Reload)
    }

    pub fn refresh(&self) -> CycleHandle {
        {
            let control = self.inner.control();
            if control.disposed {
                return CycleHandle::ready(control.generation, Err(FinderError::Disposed));
            }
            if !control.activated {
                return CycleHandle::ready(control.generation, Err(FinderError::NotActivated));
            }
        }
        self.inner.trigger(CycleMode::Refresh)
    }

    /// Cancels in-flight work, waits out a persist already in progress and
    /// removes this finder's contribution from the registry.
    pub async fn dispose(&self) {
        let tasks = {
            let mut control = self.inner.control();
            if control.disposed {
                return;
            }
            control.disposed = true;
            control.in_flight = None;
            std::mem::take(&mut control.tasks)
        };

        self.inner.shutdown.send_replace(true);
        for task in tasks {
            task.abort();
        }
        self.inner.registry.release(&self.inner.owner).await;
        drop(self.inner.persist_lock.lock().await);
        self.inner.state.send_replace(FinderState::Disposed);
        info!(event = "kernel_finder_disposed", finder = %self.inner.owner);
    }
}

impl FinderInner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.control().disposed
    }

    fn set_state(&self, next: FinderState) {
        self.state.send_if_modified(|current| {
            if *current == FinderState::Disposed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn trigger(self: &Arc<Self>, mode: CycleMode) -> CycleHandle {
        let mut control = self.control();
        if control.disposed {
            return CycleHandle::ready(control.generation, Err(FinderError::Disposed));
        }

        let previous = control
            .in_flight
            .clone()
            .filter(|handle| !handle.is_finished());
        if let (Some(handle), CycleMode::Refresh) = (&previous, mode) {
            debug!(
                event = "kernel_refresh_coalesced",
                finder = %self.owner,
                generation = handle.generation()
            );
            return handle.clone();
        }

        control.generation += 1;
        let generation = control.generation;
        let (tx, rx) = watch::channel(None);
        let inner = Arc::clone(self);
        // A reload queues behind the in-flight cycle instead of racing it.
        tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.outcome().await;
            }
            let cycle = tokio::spawn({
                let inner = Arc::clone(&inner);
                async move { inner.run_cycle(generation, mode).await }
            });
            let outcome = match cycle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        event = "kernel_refresh_aborted",
                        finder = %inner.owner,
                        generation,
                        error = %err
                    );
                    inner.set_state(FinderState::Refreshed);
                    Err(FinderError::Internal(err.to_string()))
                }
            };
            tx.send_replace(Some(outcome));
        });

        let handle = CycleHandle {
            generation,
            outcome: rx,
        };
        control.in_flight = Some(handle.clone());
        handle
    }

    async fn run_cycle(&self, generation: u64, mode: CycleMode) -> CycleOutcome {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(FinderError::Disposed);
        }

        let reconciled = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => Err(FinderError::Disposed),
            result = self.reconcile(generation, mode) => result,
        };

        let outcome = match reconciled {
            Ok((slot, merge, failed_sources)) => {
                // Persist runs outside the cancellable section and is
                // serialized against dispose by the persist lock.
                let published = merge.merged.len();
                let persisted = self.persist(&slot, merge.merged).await;
                info!(
                    event = "kernel_refresh_completed",
                    finder = %self.owner,
                    generation,
                    server = %slot.server,
                    published,
                    from_cache = merge.from_cache,
                    failed_sources = failed_sources.len(),
                    persisted
                );
                Ok(RefreshReport {
                    generation,
                    server: slot.server,
                    published,
                    from_cache: merge.from_cache,
                    failed_sources,
                    persisted,
                })
            }
            Err(err) => {
                if err != FinderError::Disposed {
                    warn!(
                        event = "kernel_refresh_failed",
                        finder = %self.owner,
                        generation,
                        error = %err
                    );
                }
                Err(err)
            }
        };

        self.set_state(FinderState::Refreshed);
        outcome
    }

    async fn reconcile(
        &self,
        generation: u64,
        mode: CycleMode,
    ) -> Result<(CacheSlot, MergeOutcome, Vec<DiscoverySource>), FinderError> {
        let mut carried = self.carried.lock().await;

        let Some(server) = self.identity.current() else {
            if carried.server.take().is_some() {
                carried.entries.clear();
                self.registry
                    .replace_contribution(&self.owner, Vec::new())
                    .await?;
            }
            return Err(FinderError::NoServer);
        };
        let slot = CacheSlot::new(self.config.cache_key.clone(), server.clone());

        let mut mode = mode;
        if carried.server.as_ref() != Some(&server) {
            if let Some(previous) = carried.server.take() {
                info!(
                    event = "kernel_finder_server_switched",
                    finder = %self.owner,
                    from = %previous,
                    to = %server
                );
                self.registry
                    .replace_contribution(&self.owner, Vec::new())
                    .await?;
            }
            carried.entries.clear();
            mode = CycleMode::Reload;
        }

        let freshly_validated = mode == CycleMode::Reload;
        if freshly_validated {
            self.set_state(FinderState::LoadingCache);
            carried.entries = self.load_cache(&slot).await?;
            carried.server = Some(server.clone());
            self.set_state(FinderState::CacheApplied);
        }

        self.set_state(FinderState::Refreshing);
        let round = self.discover(&server).await;
        if round.failed.len() == DiscoverySource::ALL.len() {
            return Err(FinderError::ServerUnreachable {
                server: server.to_string(),
            });
        }

        let build = build_connections(&server, &round.listing);
        if build.duplicate_ids > 0 || build.invalid_entries > 0 || build.orphaned_sessions > 0 {
            debug!(
                event = "kernel_connections_built",
                finder = %self.owner,
                generation,
                connections = build.connections.len(),
                duplicate_ids = build.duplicate_ids,
                invalid_entries = build.invalid_entries,
                orphaned_sessions = build.orphaned_sessions
            );
        }

        let merge = self
            .merge(build.connections, &mut carried, &round.failed, freshly_validated)
            .await;
        self.registry
            .replace_contribution(&self.owner, merge.merged.clone())
            .await?;

        Ok((slot, merge, round.failed))
    }

    /// Loads the snapshot for `slot` and validates every entry concurrently.
    /// Valid entries reach the registry as soon as they resolve.
    async fn load_cache(&self, slot: &CacheSlot) -> Result<Vec<ConnectionDescriptor>, FinderError> {
        let snapshot = match self.store.load(slot).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(event = "kernel_cache_miss", finder = %self.owner, server = %slot.server);
                return Ok(Vec::new());
            }
            Err(err) => {
                warn!(
                    event = "kernel_cache_load_failed",
                    finder = %self.owner,
                    server = %slot.server,
                    error = %err
                );
                return Ok(Vec::new());
            }
        };

        if !snapshot.matches_version(&self.config.extension_version) {
            info!(
                event = "kernel_cache_version_mismatch",
                finder = %self.owner,
                cached = %snapshot.extension_version,
                current = %self.config.extension_version
            );
        }

        let total = snapshot.connections.len();
        let mut seen = HashSet::new();
        let mut pending = snapshot
            .connections
            .into_iter()
            .filter(|descriptor| descriptor.server() == &slot.server)
            .filter(|descriptor| seen.insert(descriptor.id().to_string()))
            .enumerate()
            .map(|(index, descriptor)| async move {
                let valid = self.validate_entry(&descriptor).await;
                (index, descriptor, valid)
            })
            .collect::<FuturesUnordered<_>>();

        let mut accepted = Vec::new();
        while let Some((index, descriptor, valid)) = pending.next().await {
            if !valid {
                continue;
            }
            self.registry
                .upsert_many(&self.owner, vec![descriptor.clone()])
                .await?;
            accepted.push((index, descriptor));
        }
        accepted.sort_by_key(|(index, _)| *index);

        info!(
            event = "kernel_cache_loaded",
            finder = %self.owner,
            server = %slot.server,
            cached = total,
            accepted = accepted.len()
        );
        Ok(accepted.into_iter().map(|(_, descriptor)| descriptor).collect())
    }

    async fn validate_entry(&self, descriptor: &ConnectionDescriptor) -> bool {
        let check = self.validator.is_valid(descriptor);
        let result = match self.config.validation_timeout {
            Some(limit) => match tokio::time::timeout(limit, check).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        event = "kernel_cache_validation_timeout",
                        finder = %self.owner,
                        connection = descriptor.id(),
                        timeout_ms = limit.as_millis() as u64
                    );
                    return false;
                }
            },
            None => check.await,
        };

        match result {
            Ok(valid) => valid,
            Err(err) => {
                warn!(
                    event = "kernel_cache_validation_failed",
                    finder = %self.owner,
                    connection = descriptor.id(),
                    error = %err
                );
                false
            }
        }
    }

    async fn discover(&self, server: &ServerIdentity) -> DiscoveryRound {
        let (specs, kernels, sessions) = tokio::join!(
            self.discovery.list_kernel_specs(server),
            self.discovery.list_running_kernels(server),
            self.discovery.list_running_sessions(server),
        );

        let mut failed = Vec::new();
        let listing = DiscoveryListing {
            specs: self.degrade(DiscoverySource::KernelSpecs, specs, &mut failed),
            kernels: self.degrade(DiscoverySource::RunningKernels, kernels, &mut failed),
            sessions: self.degrade(DiscoverySource::RunningSessions, sessions, &mut failed),
        };
        DiscoveryRound { listing, failed }
    }

    fn degrade<T>(
        &self,
        source: DiscoverySource,
        result: Result<Vec<T>, crate::collaborators::DiscoveryError>,
        failed: &mut Vec<DiscoverySource>,
    ) -> Vec<T> {
        match result {
            Ok(items) => items,
            Err(err) => {
                warn!(
                    event = "kernel_discovery_failed",
                    finder = %self.owner,
                    source = source.as_str(),
                    error = %err
                );
                failed.push(source);
                Vec::new()
            }
        }
    }

    /// Fresh descriptors win on id. Cache-validated live kernels not seen by
    /// discovery are still honored; carried over from an earlier cycle they
    /// are validated again first. Carried specs (cached, or from the last
    /// successful spec listing) only surface while the spec listing fails.
    async fn merge(
        &self,
        fresh: Vec<ConnectionDescriptor>,
        carried: &mut CarriedCache,
        failed: &[DiscoverySource],
        freshly_validated: bool,
    ) -> MergeOutcome {
        let spec_listing_ok = !failed.contains(&DiscoverySource::KernelSpecs);
        let fresh_ids = fresh
            .iter()
            .map(|descriptor| descriptor.id().to_string())
            .collect::<HashSet<_>>();

        let mut needs_check = Vec::new();
        for descriptor in &carried.entries {
            if !descriptor.is_live() || freshly_validated || fresh_ids.contains(descriptor.id()) {
                continue;
            }
            needs_check.push(descriptor.clone());
        }
        let checks = futures_util::future::join_all(
            needs_check
                .iter()
                .map(|descriptor| self.validate_entry(descriptor)),
        )
        .await;
        let dropped = needs_check
            .iter()
            .zip(checks)
            .filter(|(_, valid)| !valid)
            .map(|(descriptor, _)| descriptor.id().to_string())
            .collect::<HashSet<_>>();

        carried.entries.retain(|descriptor| {
            if dropped.contains(descriptor.id()) {
                return false;
            }
            descriptor.is_live() || !spec_listing_ok
        });

        let listed_specs = if spec_listing_ok {
            fresh
                .iter()
                .filter(|descriptor| !descriptor.is_live())
                .cloned()
                .collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        let mut merged = fresh;
        let mut from_cache = 0;
        for descriptor in &carried.entries {
            if fresh_ids.contains(descriptor.id()) {
                continue;
            }
            merged.push(descriptor.clone());
            from_cache += 1;
        }
        carried.entries.extend(listed_specs);

        if !dropped.is_empty() {
            debug!(
                event = "kernel_cache_entries_expired",
                finder = %self.owner,
                dropped = dropped.len()
            );
        }
        MergeOutcome { merged, from_cache }
    }

    async fn persist(&self, slot: &CacheSlot, merged: Vec<ConnectionDescriptor>) -> bool {
        let _guard = self.persist_lock.lock().await;
        if self.is_disposed() {
            return false;
        }

        let snapshot = CacheSnapshot::new(self.config.extension_version.clone(), merged);
        match self.store.save(slot, &snapshot).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    event = "kernel_cache_persist_failed",
                    finder = %self.owner,
                    server = %slot.server,
                    error = %err
                );
                false
            }
        }
    }

    fn spawn_identity_watcher(this: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let mut identity = this.identity.watch();
        let mut shutdown = this.shutdown.subscribe();
        let task = tokio::spawn(async move {
            identity.borrow_and_update();
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    changed = identity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = identity.borrow_and_update().clone();
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        info!(
                            event = "kernel_server_identity_changed",
                            finder = %inner.owner,
                            server = next.as_ref().map(ToString::to_string).unwrap_or_default()
                        );
                        inner.trigger(CycleMode::Reload);
                    }
                }
            }
        });
        this.control().tasks.push(task);
    }

    fn spawn_refresh_timer(this: &Arc<Self>) {
        let Some(period) = this.config.refresh_interval else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(this);
        let mut shutdown = this.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        inner.trigger(CycleMode::Refresh);
                    }
                }
            }
        });
        this.control().tasks.push(task);
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
