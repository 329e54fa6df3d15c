//! Model lifecycle manager
//!
//! Owns every [`ManagedModel`] and the device RAM budget. Loads go through
//! [`ModelLifecycleManager::ensure`], which:
//! - returns ready models immediately (refreshing their recency)
//! - joins an in-flight load of the same slug instead of starting another
//! - otherwise queues a load behind one global lock, so at most one engine
//!   initializes at a time across the process
//!
//! Before a load, least-recently-used non-hot models are evicted until the
//! estimated footprint fits. When nothing more can be evicted the load still
//! proceeds and a [`LifecycleEvent::BudgetOvercommit`] is emitted.

use crate::artifacts::ArtifactSource;
use crate::catalog::{Catalog, CatalogEntry, ModelTier};
use crate::device::{self, DEVICE_PROFILES, DeviceProfile, MemoryProbe};
use crate::engine::{EngineHandle, EngineVariant};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OnceCell, RwLock, broadcast};

/// Quantization and runtime overhead applied to catalog download sizes
pub const RAM_OVERHEAD_FACTOR: f64 = 1.3;

/// Footprint assumed for slugs missing from the catalog
pub const UNKNOWN_MODEL_RAM_MB: u64 = 500;

/// Estimated resident footprint of a model
pub fn estimate_ram_mb(entry: Option<&CatalogEntry>) -> u64 {
    match entry {
        Some(entry) => (entry.size_mb as f64 * RAM_OVERHEAD_FACTOR).round() as u64,
        None => UNKNOWN_MODEL_RAM_MB,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Error,
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unloaded => write!(f, "unloaded"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A model tracked by the manager. Callers receive snapshots; the engine
/// handle inside stays owned by the manager until release.
#[derive(Debug, Clone)]
pub struct ManagedModel {
    pub slug: String,
    pub tier: ModelTier,
    pub state: ModelState,
    pub engine: Option<EngineHandle>,
    pub last_used: Option<DateTime<Utc>>,
    /// Estimated footprint while ready, zero otherwise
    pub ram_mb: u64,
    pub last_error: Option<String>,
}

impl ManagedModel {
    fn unloaded(slug: &str, tier: ModelTier) -> Self {
        Self {
            slug: slug.to_string(),
            tier,
            state: ModelState::Unloaded,
            engine: None,
            last_used: None,
            ram_mb: 0,
            last_error: None,
        }
    }

    /// True when the alternate engine variant is serving this model
    pub fn is_custom_engine(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|h| h.variant == EngineVariant::Fallback)
    }

    pub fn report(&self) -> ModelStatusReport {
        ModelStatusReport {
            slug: self.slug.clone(),
            tier: self.tier,
            state: self.state,
            ram_mb: self.ram_mb,
            last_used: self.last_used,
            engine: self.engine.as_ref().map(|h| h.variant),
            is_custom_engine: self.is_custom_engine(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Serializable view of a managed model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusReport {
    pub slug: String,
    pub tier: ModelTier,
    pub state: ModelState,
    pub ram_mb: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub engine: Option<EngineVariant>,
    pub is_custom_engine: bool,
    pub last_error: Option<String>,
}

/// Emitted after every state mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Initialized { profile: String, ram_budget_mb: u64 },
    StateChanged { slug: String, state: ModelState },
    /// A ready model was handed out again
    Used { slug: String },
    Evicted { slug: String, ram_mb: u64 },
    Released { slug: String, ram_mb: u64 },
    /// A load is proceeding past the budget
    BudgetOvercommit { slug: String, needed_mb: u64, free_mb: i64 },
}

type Listener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerSet {
    next_id: AtomicU64,
    listeners: std::sync::Mutex<Vec<(u64, Listener)>>,
}

impl ListenerSet {
    /// Listeners run outside the lock, so a poisoned lock still guards a
    /// consistent list
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, listener: Listener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, listener));
        id
    }

    fn remove(&self, id: u64) {
        self.lock().retain(|(existing, _)| *existing != id);
    }

    /// Invoke every listener; a panicking listener does not stop the rest
    fn notify(&self, event: &LifecycleEvent) {
        let snapshot: Vec<Listener> = self.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(event = ?event, "Lifecycle listener panicked");
            }
        }
    }
}

/// Handle returned by [`ModelLifecycleManager::subscribe`]; dropping it
/// unsubscribes
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    set: Weak<ListenerSet>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.remove(self.id);
        }
    }
}

#[derive(Default)]
struct LifecycleState {
    models: HashMap<String, ManagedModel>,
    profile: Option<DeviceProfile>,
}

impl LifecycleState {
    fn loaded_ram_mb(&self) -> u64 {
        self.models
            .values()
            .filter(|m| m.state == ModelState::Ready)
            .map(|m| m.ram_mb)
            .sum()
    }

    fn budget_mb(&self) -> u64 {
        self.profile.as_ref().map_or(0, |p| p.ram_budget_mb)
    }
}

type SharedLoad = Shared<BoxFuture<'static, OrchestratorResult<ManagedModel>>>;

/// Orchestrates model loading, eviction and release under a RAM budget
pub struct ModelLifecycleManager {
    catalog: Arc<Catalog>,
    probe: Arc<dyn MemoryProbe>,
    resolver: Arc<dyn ArtifactSource>,
    profiles: Vec<DeviceProfile>,
    state: RwLock<LifecycleState>,
    initialized: OnceCell<()>,
    /// Global serialization point for engine initialization
    load_lock: Mutex<()>,
    inflight: Mutex<HashMap<String, SharedLoad>>,
    listeners: Arc<ListenerSet>,
    event_tx: broadcast::Sender<LifecycleEvent>,
}

impl ModelLifecycleManager {
    pub fn new(
        catalog: Arc<Catalog>,
        probe: Arc<dyn MemoryProbe>,
        resolver: Arc<dyn ArtifactSource>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            catalog,
            probe,
            resolver,
            profiles: DEVICE_PROFILES.clone(),
            state: RwLock::new(LifecycleState::default()),
            initialized: OnceCell::new(),
            load_lock: Mutex::new(()),
            inflight: Mutex::new(HashMap::new()),
            listeners: Arc::new(ListenerSet::default()),
            event_tx,
        }
    }

    /// Replace the built-in device profiles
    pub fn with_profiles(mut self, profiles: Vec<DeviceProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Subscribe to lifecycle events over a broadcast channel
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.event_tx.subscribe()
    }

    /// Register a synchronous observer called after every state mutation
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let id = self.listeners.add(Arc::new(listener));
        Subscription {
            id,
            set: Arc::downgrade(&self.listeners),
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.event_tx.send(event.clone());
        self.listeners.notify(&event);
    }

    fn tier_of(&self, slug: &str, profile: Option<&DeviceProfile>) -> ModelTier {
        if profile.is_some_and(|p| p.hot_models.iter().any(|h| h == slug)) {
            ModelTier::Hot
        } else {
            self.catalog.tier(slug)
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Resolve the device profile and register every catalog entry as
    /// unloaded. Later calls are no-ops.
    pub async fn init(&self) {
        self.initialized
            .get_or_init(|| async {
                let total_ram = device::detect_total_memory(self.probe.as_ref());
                let profile = device::resolve_profile_from(&self.profiles, total_ram);

                tracing::info!(
                    profile = %profile.name,
                    ram_budget_mb = profile.ram_budget_mb,
                    hot_models = ?profile.hot_models,
                    max_concurrent_models = profile.max_concurrent_models,
                    "Resolved device profile"
                );

                let event = LifecycleEvent::Initialized {
                    profile: profile.name.clone(),
                    ram_budget_mb: profile.ram_budget_mb,
                };
                metrics::update_ram_budget(profile.ram_budget_mb);

                {
                    let mut state = self.state.write().await;
                    for entry in self.catalog.entries() {
                        let tier = self.tier_of(&entry.slug, Some(&profile));
                        state
                            .models
                            .insert(entry.slug.clone(), ManagedModel::unloaded(&entry.slug, tier));
                    }
                    state.profile = Some(profile);
                }

                self.emit(event);
            })
            .await;
    }

    /// Mark a ready model as used and return a snapshot of it
    async fn touch_if_ready(&self, slug: &str) -> Option<ManagedModel> {
        let snapshot = {
            let mut state = self.state.write().await;
            let model = state.models.get_mut(slug)?;
            if model.state != ModelState::Ready {
                return None;
            }
            model.last_used = Some(Utc::now());
            model.clone()
        };
        self.emit(LifecycleEvent::Used {
            slug: slug.to_string(),
        });
        Some(snapshot)
    }

    /// Return a ready model, loading it if necessary.
    ///
    /// Concurrent calls for the same slug share one load and receive the same
    /// outcome. Loads are not cancellable: dropping the returned future leaves
    /// the load running for the other waiters.
    pub async fn ensure(self: &Arc<Self>, slug: &str) -> OrchestratorResult<ManagedModel> {
        self.init().await;

        if let Some(model) = self.touch_if_ready(slug).await {
            return Ok(model);
        }

        let load = {
            let mut inflight = self.inflight.lock().await;

            // The load may have completed while we waited for the lock
            if let Some(model) = self.touch_if_ready(slug).await {
                return Ok(model);
            }

            match inflight.get(slug) {
                Some(existing) => {
                    tracing::debug!(slug = %slug, "Joining in-flight load");
                    existing.clone()
                }
                None => {
                    let manager = Arc::clone(self);
                    let owned = slug.to_string();
                    let task = tokio::spawn(async move {
                        let result = manager.load_serialized(&owned).await;
                        manager.inflight.lock().await.remove(&owned);
                        result
                    });
                    let shared = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(OrchestratorError::engine(format!("load task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    inflight.insert(slug.to_string(), shared.clone());
                    shared
                }
            }
        };

        load.await
    }

    async fn load_serialized(&self, slug: &str) -> OrchestratorResult<ManagedModel> {
        let _guard = self.load_lock.lock().await;
        self.load_model(slug).await
    }

    /// Evict, resolve and initialize one model. Only reachable through
    /// `ensure`, which holds the global load lock.
    async fn load_model(&self, slug: &str) -> OrchestratorResult<ManagedModel> {
        let entry = self.catalog.get(slug);

        if entry.is_some_and(|e| e.is_stt) {
            return Err(OrchestratorError::UnsupportedModelKind {
                slug: slug.to_string(),
            });
        }

        let needed_mb = estimate_ram_mb(entry);
        self.evict_if_needed_for(slug, needed_mb).await;

        {
            let mut state = self.state.write().await;
            let tier = self.tier_of(slug, state.profile.as_ref());
            let model = state
                .models
                .entry(slug.to_string())
                .or_insert_with(|| ManagedModel::unloaded(slug, tier));
            model.state = ModelState::Loading;
            model.last_error = None;
        }
        self.emit(LifecycleEvent::StateChanged {
            slug: slug.to_string(),
            state: ModelState::Loading,
        });

        tracing::info!(slug = %slug, estimated_ram_mb = needed_mb, "Loading model");
        metrics::record_load_started(slug);

        match self.resolver.resolve(slug, entry).await {
            Ok(handle) => {
                let variant = handle.variant;
                let (snapshot, loaded_ram) = {
                    let mut state = self.state.write().await;
                    let tier = self.tier_of(slug, state.profile.as_ref());
                    let model = state
                        .models
                        .entry(slug.to_string())
                        .or_insert_with(|| ManagedModel::unloaded(slug, tier));
                    model.state = ModelState::Ready;
                    model.engine = Some(handle);
                    model.last_used = Some(Utc::now());
                    model.ram_mb = needed_mb;
                    let snapshot = model.clone();
                    (snapshot, state.loaded_ram_mb())
                };

                metrics::record_load_succeeded(slug, &variant.to_string());
                metrics::update_loaded_ram(loaded_ram);
                tracing::info!(
                    slug = %slug,
                    ram_mb = needed_mb,
                    engine = %variant,
                    loaded_ram_mb = loaded_ram,
                    "Model loaded"
                );
                self.emit(LifecycleEvent::StateChanged {
                    slug: slug.to_string(),
                    state: ModelState::Ready,
                });
                Ok(snapshot)
            }
            Err(e) => {
                {
                    let mut state = self.state.write().await;
                    if let Some(model) = state.models.get_mut(slug) {
                        model.state = ModelState::Error;
                        model.engine = None;
                        model.ram_mb = 0;
                        model.last_error = Some(e.to_string());
                    }
                }

                metrics::record_load_failed(slug);
                tracing::error!(slug = %slug, error = %e, "Failed to load model");
                self.emit(LifecycleEvent::StateChanged {
                    slug: slug.to_string(),
                    state: ModelState::Error,
                });
                Err(e)
            }
        }
    }

    /// Evict least-recently-used non-hot models until `needed_mb` fits.
    /// Returns the free budget afterwards, which may still be short.
    ///
    /// Waits for any in-flight load; eviction never overlaps one.
    pub async fn evict_if_needed(&self, needed_mb: u64) -> i64 {
        let _guard = self.load_lock.lock().await;
        self.evict_if_needed_for("", needed_mb).await
    }

    async fn evict_if_needed_for(&self, slug: &str, needed_mb: u64) -> i64 {
        let (mut free_mb, candidates) = {
            let state = self.state.read().await;
            let free_mb = state.budget_mb() as i64 - state.loaded_ram_mb() as i64;

            let mut candidates: Vec<&ManagedModel> = state
                .models
                .values()
                .filter(|m| m.state == ModelState::Ready && m.tier != ModelTier::Hot)
                .collect();
            candidates.sort_by(|a, b| {
                a.last_used
                    .cmp(&b.last_used)
                    .then(a.tier.eviction_rank().cmp(&b.tier.eviction_rank()))
            });
            let candidates: Vec<String> = candidates.into_iter().map(|m| m.slug.clone()).collect();
            (free_mb, candidates)
        };

        if free_mb >= needed_mb as i64 {
            return free_mb;
        }

        for victim in candidates {
            if free_mb >= needed_mb as i64 {
                break;
            }
            tracing::info!(slug = %victim, for_model = %slug, "Evicting model");
            if let Some(freed) = self.release_one(&victim, true).await {
                free_mb += freed as i64;
            }
        }

        if free_mb < needed_mb as i64 {
            tracing::warn!(
                slug = %slug,
                needed_mb = needed_mb,
                free_mb = free_mb,
                "RAM budget tight after eviction, loading anyway"
            );
            metrics::record_overcommit();
            self.emit(LifecycleEvent::BudgetOvercommit {
                slug: slug.to_string(),
                needed_mb,
                free_mb,
            });
        }

        free_mb
    }

    /// Unload one ready model and destroy its engine. Returns the freed RAM,
    /// or `None` when the model was not ready.
    async fn release_one(&self, slug: &str, evicted: bool) -> Option<u64> {
        let (engine, ram_mb, loaded_ram) = {
            let mut state = self.state.write().await;
            let model = state.models.get_mut(slug)?;
            if model.state != ModelState::Ready {
                return None;
            }
            let engine = model.engine.take();
            let ram_mb = model.ram_mb;
            model.state = ModelState::Unloaded;
            model.ram_mb = 0;
            (engine, ram_mb, state.loaded_ram_mb())
        };

        if let Some(handle) = engine
            && let Err(e) = handle.engine.destroy().await
        {
            tracing::warn!(slug = %slug, error = %e, "Engine destroy failed");
        }

        metrics::update_loaded_ram(loaded_ram);
        let event = if evicted {
            metrics::record_eviction(slug);
            LifecycleEvent::Evicted {
                slug: slug.to_string(),
                ram_mb,
            }
        } else {
            tracing::info!(slug = %slug, ram_mb = ram_mb, "Released model");
            LifecycleEvent::Released {
                slug: slug.to_string(),
                ram_mb,
            }
        };
        self.emit(event);
        Some(ram_mb)
    }

    /// Unload a model if it is ready; returns whether anything was released
    pub async fn release(&self, slug: &str) -> bool {
        self.release_one(slug, false).await.is_some()
    }

    /// Unload every ready model; returns the released slugs
    pub async fn release_all(&self) -> Vec<String> {
        let mut released = Vec::new();
        for model in self.loaded_models().await {
            if self.release_one(&model.slug, false).await.is_some() {
                released.push(model.slug);
            }
        }
        tracing::info!(count = released.len(), "Released all models");
        released
    }

    pub async fn loaded_models(&self) -> Vec<ManagedModel> {
        let state = self.state.read().await;
        let mut models: Vec<ManagedModel> = state
            .models
            .values()
            .filter(|m| m.state == ModelState::Ready)
            .cloned()
            .collect();
        models.sort_by(|a, b| a.slug.cmp(&b.slug));
        models
    }

    pub async fn all_models(&self) -> Vec<ManagedModel> {
        let state = self.state.read().await;
        let mut models: Vec<ManagedModel> = state.models.values().cloned().collect();
        models.sort_by(|a, b| a.slug.cmp(&b.slug));
        models
    }

    pub async fn get(&self, slug: &str) -> Option<ManagedModel> {
        self.state.read().await.models.get(slug).cloned()
    }

    pub async fn total_loaded_ram_mb(&self) -> u64 {
        self.state.read().await.loaded_ram_mb()
    }

    pub async fn ram_budget_mb(&self) -> u64 {
        self.state.read().await.budget_mb()
    }

    pub async fn device_profile(&self) -> Option<DeviceProfile> {
        self.state.read().await.profile.clone()
    }

    /// State of a slug; unknown slugs read as unloaded
    pub async fn model_state(&self, slug: &str) -> ModelState {
        self.state
            .read()
            .await
            .models
            .get(slug)
            .map_or(ModelState::Unloaded, |m| m.state)
    }

    pub async fn status_report(&self) -> Vec<ModelStatusReport> {
        self.all_models()
            .await
            .iter()
            .map(ManagedModel::report)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::mocks::MockArtifactSource;
    use crate::device::FixedMemoryProbe;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const GB: u64 = 1024 * 1024 * 1024;

    fn manager(ram_bytes: u64, source: Arc<MockArtifactSource>) -> Arc<ModelLifecycleManager> {
        Arc::new(ModelLifecycleManager::new(
            Arc::new(Catalog::default()),
            Arc::new(FixedMemoryProbe(ram_bytes)),
            source,
        ))
    }

    fn profile(budget: u64, hot: &[&str]) -> DeviceProfile {
        DeviceProfile {
            name: "test".to_string(),
            min_ram_gb: 0.0,
            ram_budget_mb: budget,
            hot_models: hot.iter().map(|s| s.to_string()).collect(),
            max_concurrent_models: 4,
        }
    }

    fn manager_with_budget(
        budget: u64,
        hot: &[&str],
        source: Arc<MockArtifactSource>,
    ) -> Arc<ModelLifecycleManager> {
        Arc::new(
            ModelLifecycleManager::new(
                Arc::new(Catalog::default()),
                Arc::new(FixedMemoryProbe(8 * GB)),
                source,
            )
            .with_profiles(vec![profile(budget, hot)]),
        )
    }

    fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn tick() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    #[test]
    fn test_estimate_ram() {
        let catalog = Catalog::default();
        assert_eq!(estimate_ram_mb(catalog.get("lfm2-1.2b")), 780);
        assert_eq!(estimate_ram_mb(catalog.get("lfm2-350m")), 260);
        assert_eq!(estimate_ram_mb(None), UNKNOWN_MODEL_RAM_MB);
    }

    #[tokio::test]
    async fn test_init_registers_catalog_once() {
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager(5 * GB, source);
        let mut rx = manager.subscribe_events();

        manager.init().await;
        manager.init().await;

        assert!(manager.is_initialized());
        assert_eq!(manager.all_models().await.len(), Catalog::default().len());
        assert_eq!(manager.ram_budget_mb().await, 800);
        assert_eq!(manager.device_profile().await.unwrap().name, "low");

        let inits = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, LifecycleEvent::Initialized { .. }))
            .count();
        assert_eq!(inits, 1);
    }

    #[tokio::test]
    async fn test_profile_hot_list_promotes_tier() {
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager_with_budget(2000, &["lfm2-1.2b"], source);
        manager.init().await;

        assert_eq!(manager.get("lfm2-1.2b").await.unwrap().tier, ModelTier::Hot);
        assert_eq!(manager.get("lfm2-700m").await.unwrap().tier, ModelTier::Cold);
    }

    #[tokio::test]
    async fn test_ensure_loads_and_reuses() {
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager(12 * GB, source.clone());

        let first = manager.ensure("lfm2-350m").await.unwrap();
        assert_eq!(first.state, ModelState::Ready);
        assert_eq!(first.ram_mb, 260);
        assert!(first.last_used.is_some());

        tick().await;
        let second = manager.ensure("lfm2-350m").await.unwrap();
        assert!(second.last_used > first.last_used);
        assert!(
            first
                .engine
                .as_ref()
                .unwrap()
                .same_engine(second.engine.as_ref().unwrap())
        );
        assert_eq!(source.resolve_count("lfm2-350m"), 1);
        assert_eq!(manager.total_loaded_ram_mb().await, 260);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_single_load() {
        let source = Arc::new(MockArtifactSource::new().with_delay(Duration::from_millis(50)));
        let manager = manager(12 * GB, source.clone());

        let calls = (0..8).map(|_| {
            let manager = manager.clone();
            async move { manager.ensure("lfm2-1.2b").await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(source.resolve_count("lfm2-1.2b"), 1);
        let first = results[0].as_ref().unwrap().engine.clone().unwrap();
        for result in &results {
            let model = result.as_ref().unwrap();
            assert!(model.engine.as_ref().unwrap().same_engine(&first));
        }
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_failure() {
        let source = Arc::new(MockArtifactSource::new().with_delay(Duration::from_millis(30)));
        source.fail("lfm2-700m");
        let manager = manager(12 * GB, source.clone());

        let calls = (0..4).map(|_| {
            let manager = manager.clone();
            async move { manager.ensure("lfm2-700m").await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(source.resolve_count("lfm2-700m"), 1);
        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(manager.model_state("lfm2-700m").await, ModelState::Error);
    }

    #[tokio::test]
    async fn test_loads_are_serialized_across_slugs() {
        let source = Arc::new(MockArtifactSource::new().with_delay(Duration::from_millis(20)));
        let manager = manager(12 * GB, source.clone());

        let slugs = ["lfm2-350m", "lfm2-700m", "lfm2-1.2b", "lfm2-vl-450m"];
        let calls = slugs.iter().map(|slug| {
            let manager = manager.clone();
            async move { manager.ensure(slug).await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_does_not_block_next() {
        let source = Arc::new(MockArtifactSource::new().with_delay(Duration::from_millis(10)));
        source.fail("lfm2-700m");
        let manager = manager(12 * GB, source.clone());

        let (failed, loaded) = tokio::join!(manager.ensure("lfm2-700m"), manager.ensure("lfm2-1.2b"));
        assert!(failed.is_err());
        assert_eq!(loaded.unwrap().state, ModelState::Ready);

        let errored = manager.get("lfm2-700m").await.unwrap();
        assert!(errored.engine.is_none());
        assert!(errored.last_error.is_some());

        // Retry succeeds once the cause clears
        source.unfail("lfm2-700m");
        let retried = manager.ensure("lfm2-700m").await.unwrap();
        assert_eq!(retried.state, ModelState::Ready);
        assert!(retried.last_error.is_none());
    }

    #[tokio::test]
    async fn test_stt_model_rejected() {
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager(12 * GB, source.clone());

        let err = manager.ensure("whisper-small").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnsupportedModelKind { .. }));
        assert_eq!(source.resolve_count("whisper-small"), 0);
        assert_eq!(manager.model_state("whisper-small").await, ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_unknown_slug_loads_as_cold() {
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager(12 * GB, source);

        let model = manager.ensure("my-local-model").await.unwrap();
        assert_eq!(model.tier, ModelTier::Cold);
        assert_eq!(model.ram_mb, UNKNOWN_MODEL_RAM_MB);
    }

    #[tokio::test]
    async fn test_warm_model_evicted_for_larger_model() {
        // 5 GB device: low profile, 800 MB budget
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager(5 * GB, source.clone());

        let warm = manager.ensure("lfm2-1.2b").await.unwrap();
        assert_eq!(warm.tier, ModelTier::Warm);
        assert_eq!(warm.ram_mb, 780);

        let larger = manager.ensure("lfm2-vl-1.6b").await.unwrap();
        assert_eq!(larger.state, ModelState::Ready);
        assert_eq!(manager.model_state("lfm2-1.2b").await, ModelState::Unloaded);
        assert_eq!(manager.get("lfm2-1.2b").await.unwrap().ram_mb, 0);
        assert_eq!(source.destroyed_count(), 1);
    }

    #[tokio::test]
    async fn test_hot_models_never_evicted() {
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager(5 * GB, source.clone());
        let mut rx = manager.subscribe_events();

        manager.ensure("lfm2-350m").await.unwrap();
        manager.ensure("lfm25-mobile-actions").await.unwrap();
        manager.ensure("lfm2-vl-1.6b").await.unwrap();
        manager.ensure("lfm25-1.2b-thinking").await.unwrap();

        assert_eq!(manager.model_state("lfm2-350m").await, ModelState::Ready);
        assert_eq!(
            manager.model_state("lfm25-mobile-actions").await,
            ModelState::Ready
        );

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, LifecycleEvent::BudgetOvercommit { .. })));
        for event in &events {
            if let LifecycleEvent::Evicted { slug, .. } = event {
                assert_ne!(slug, "lfm2-350m");
                assert_ne!(slug, "lfm25-mobile-actions");
            }
        }
        // Soft overcommit: the budget is exceeded rather than failing the load
        assert!(manager.total_loaded_ram_mb().await > manager.ram_budget_mb().await);
    }

    #[tokio::test]
    async fn test_eviction_order_is_least_recently_used() {
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager_with_budget(2000, &["lfm2-350m"], source);
        let mut rx = manager.subscribe_events();

        for slug in ["lfm2-350m", "lfm2-1.2b", "lfm2-vl-450m", "lfm2-700m"] {
            manager.ensure(slug).await.unwrap();
            tick().await;
        }
        // Touch the oldest evictable model so it becomes the newest
        manager.ensure("lfm2-1.2b").await.unwrap();
        tick().await;

        // 260 + 780 + 390 + 520 = 1950 loaded; the thinking model needs 949
        manager.ensure("lfm25-1.2b-thinking").await.unwrap();

        let evicted: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                LifecycleEvent::Evicted { slug, .. } => Some(slug),
                _ => None,
            })
            .collect();
        assert_eq!(evicted, vec!["lfm2-vl-450m", "lfm2-700m"]);
        assert_eq!(manager.model_state("lfm2-1.2b").await, ModelState::Ready);
        assert_eq!(manager.model_state("lfm2-350m").await, ModelState::Ready);
    }

    #[tokio::test]
    async fn test_evict_if_needed_noop_when_space() {
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager(12 * GB, source);
        manager.ensure("lfm2-1.2b").await.unwrap();

        let free = manager.evict_if_needed(100).await;
        assert_eq!(free, 4000 - 780);
        assert_eq!(manager.model_state("lfm2-1.2b").await, ModelState::Ready);
    }

    #[tokio::test]
    async fn test_evict_if_needed_waits_for_in_flight_load() {
        let source = Arc::new(MockArtifactSource::new().with_delay(Duration::from_millis(50)));
        let manager = manager(12 * GB, source);

        let loader = manager.clone();
        let load = tokio::spawn(async move { loader.ensure("lfm2-1.2b").await });
        tick().await;
        assert_eq!(manager.model_state("lfm2-1.2b").await, ModelState::Loading);

        manager.evict_if_needed(100).await;
        assert_ne!(manager.model_state("lfm2-1.2b").await, ModelState::Loading);
        assert!(load.await.unwrap().is_ok());
    }

    #[test]
    fn test_listener_set_survives_poisoned_lock() {
        let set = Arc::new(ListenerSet::default());
        let poisoner = set.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.listeners.lock().unwrap();
            panic!("poison the listener lock");
        })
        .join();
        assert!(set.listeners.is_poisoned());

        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        set.add(Arc::new(move |_: &LifecycleEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        set.notify(&LifecycleEvent::Used {
            slug: "lfm2-350m".to_string(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_and_release_all() {
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager(12 * GB, source.clone());

        manager.ensure("lfm2-350m").await.unwrap();
        manager.ensure("lfm2-1.2b").await.unwrap();

        assert!(manager.release("lfm2-1.2b").await);
        assert!(!manager.release("lfm2-1.2b").await);
        assert_eq!(manager.model_state("lfm2-1.2b").await, ModelState::Unloaded);
        assert_eq!(manager.total_loaded_ram_mb().await, 260);

        manager.release_all().await;
        assert!(manager.loaded_models().await.is_empty());
        assert_eq!(manager.total_loaded_ram_mb().await, 0);
        assert_eq!(source.destroyed_count(), 2);
    }

    #[tokio::test]
    async fn test_listener_isolation_and_unsubscribe() {
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager(12 * GB, source);

        let count = Arc::new(AtomicUsize::new(0));
        let _panicking = manager.subscribe(|_| panic!("listener failure"));
        let counter = count.clone();
        let subscription = manager.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.ensure("lfm2-350m").await.unwrap();
        let seen = count.load(Ordering::SeqCst);
        // initialized, loading, ready
        assert!(seen >= 3);

        subscription.unsubscribe();
        manager.ensure("lfm2-350m").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_status_report() {
        let source = Arc::new(MockArtifactSource::new());
        let manager = manager(12 * GB, source);
        manager.ensure("lfm2-350m").await.unwrap();

        let report = manager.status_report().await;
        let entry = report.iter().find(|r| r.slug == "lfm2-350m").unwrap();
        assert_eq!(entry.state, ModelState::Ready);
        assert_eq!(entry.engine, Some(EngineVariant::Primary));
        assert!(!entry.is_custom_engine);

        let json = serde_json::to_value(entry).unwrap();
        assert_eq!(json["state"], "ready");
        assert_eq!(json["tier"], "hot");
    }
}
