//! Keyed, reference-counted registry of GPU resources bound to one thread.
//!
//! Nodes never own native handles. They register a resource under a key,
//! look it up again (adding a reference) and drop their reference when they
//! are disposed. The cache reserves resources on the GPU thread, releases
//! them all when the context goes away, and reserves them again once a new
//! context is installed.
//!
//! Locks are always taken in the order cache state, then backend, then
//! resource.
mod program;
mod target;
mod texture;
mod vertex;

pub use program::ShaderProgram;
pub use target::RenderTarget;
pub use texture::{FrameSignal, TextureClient, TextureHolder};
pub use vertex::VertexBuffer;

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use decoder::DecoderPool;

use crate::gpu::{GpuBackend, GpuError};

/// Something that owns native handles while reserved.
pub trait GpuResource: Send + 'static {
    /// Creates the native handles. Called on the GPU thread with the
    /// resource currently released.
    fn reserve(&mut self, gpu: &mut dyn GpuBackend) -> Result<(), GpuError>;
    /// Drops the native handles. `None` means the context is already gone
    /// and only bookkeeping should be reset.
    fn release(&mut self, gpu: Option<&mut dyn GpuBackend>);
}

pub type Shared<T> = Arc<Mutex<T>>;

type DynResource = Arc<Mutex<dyn GpuResource>>;
type GpuEvent = Box<dyn FnOnce(&mut dyn GpuBackend) + Send>;

/// How a bulk release treats native handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRelease {
    /// The context is still current; handles are deleted.
    Orderly,
    /// The context was lost; handles are forgotten without API calls.
    Lost,
}

struct Entry {
    resource: DynResource,
    typed: Arc<dyn Any + Send + Sync>,
    ref_count: usize,
    released: bool,
}

impl Entry {
    fn new<T: GpuResource>(shared: &Shared<T>) -> Self {
        Self {
            resource: shared.clone(),
            typed: shared.clone(),
            ref_count: 1,
            released: true,
        }
    }

    fn reserve(&mut self, key: &str, gpu: &mut dyn GpuBackend) {
        if !self.released {
            tracing::error!(key, "reserve called on a resource that is already reserved");
            return;
        }
        self.released = false;
        if let Err(err) = lock(&self.resource).reserve(gpu) {
            tracing::warn!(key, error = %err, "failed to reserve resource");
        }
    }

    fn release(&mut self, key: &str, gpu: Option<&mut dyn GpuBackend>) {
        if self.released {
            tracing::error!(key, "release called on a resource that is already released");
            return;
        }
        self.released = true;
        lock(&self.resource).release(gpu);
    }
}

#[derive(Default)]
struct CacheState {
    entries: BTreeMap<String, Entry>,
    reserve_queue: Vec<(String, DynResource)>,
    remove_queue: Vec<String>,
    events: VecDeque<GpuEvent>,
    owner: Option<ThreadId>,
    in_release: bool,
}

impl CacheState {
    fn is_owner(&self) -> bool {
        self.owner == Some(thread::current().id())
    }

    fn is_queued(&self, key: &str, resource: &DynResource) -> bool {
        self.reserve_queue
            .iter()
            .any(|(queued, pending)| queued == key && Arc::ptr_eq(pending, resource))
    }
}

pub struct ResourceCache {
    state: Mutex<CacheState>,
    gpu: Mutex<Option<Box<dyn GpuBackend>>>,
    decoders: Arc<DecoderPool>,
}

impl ResourceCache {
    pub fn new(decoders: Arc<DecoderPool>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            gpu: Mutex::new(None),
            decoders,
        }
    }

    pub fn decoders(&self) -> &Arc<DecoderPool> {
        &self.decoders
    }

    /// Registers `resource` at reference count 1 and returns a shared handle
    /// to it. Reserved immediately on the GPU thread; elsewhere it waits for
    /// the next [`ResourceCache::predraw`] with an extra reference held.
    pub fn add_resource<T: GpuResource>(&self, key: impl Into<String>, resource: T) -> Shared<T> {
        let key = key.into();
        let shared = Arc::new(Mutex::new(resource));
        let mut entry = Entry::new(&shared);

        let mut state = self.state();
        if let Some(previous) = state.entries.remove(&key) {
            tracing::warn!(key = %key, "replacing cached resource");
            self.retire(&mut state, &key, previous);
        }

        let mut gpu = self.gpu();
        match gpu.as_deref_mut() {
            Some(gpu) if state.is_owner() => entry.reserve(&key, gpu),
            _ => {
                entry.ref_count += 1;
                state
                    .reserve_queue
                    .push((key.clone(), entry.resource.clone()));
            }
        }
        drop(gpu);
        state.entries.insert(key, entry);
        shared
    }

    /// Looks `key` up and adds a reference to it.
    pub fn get_resource<T: GpuResource>(&self, key: &str) -> Option<Shared<T>> {
        let mut state = self.state();
        let entry = state.entries.get_mut(key)?;
        match Arc::downcast::<Mutex<T>>(entry.typed.clone()) {
            Ok(shared) => {
                entry.ref_count += 1;
                Some(shared)
            }
            Err(_) => {
                tracing::error!(key, "cached resource has a different type");
                None
            }
        }
    }

    /// Drops one reference. The resource is released and forgotten when the
    /// last one goes.
    pub fn remove_resource(&self, key: &str) {
        let mut state = self.state();
        let Some(entry) = state.entries.get_mut(key) else {
            tracing::warn!(key, "removing unknown resource");
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return;
        }
        if state.in_release {
            state.remove_queue.push(key.to_string());
            return;
        }
        if let Some(entry) = state.entries.remove(key) {
            self.retire(&mut state, key, entry);
        }
        if state.entries.is_empty() {
            tracing::debug!("all cached resources removed");
        }
    }

    pub fn has_resource(&self, key: &str) -> bool {
        self.state().entries.contains_key(key)
    }

    pub fn ref_count(&self, key: &str) -> Option<usize> {
        self.state().entries.get(key).map(|entry| entry.ref_count)
    }

    pub fn is_reserved(&self, key: &str) -> Option<bool> {
        self.state().entries.get(key).map(|entry| !entry.released)
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().entries.keys().cloned().collect()
    }

    /// Runs `event` with the backend during the next
    /// [`ResourceCache::predraw`]. Events must not call back into the cache.
    pub fn queue_event(&self, event: impl FnOnce(&mut dyn GpuBackend) + Send + 'static) {
        self.state().events.push_back(Box::new(event));
    }

    /// Installs a freshly created context and reserves every resource. The
    /// first call binds the cache to the calling thread.
    pub fn reserve_all(&self, backend: Box<dyn GpuBackend>) {
        let mut state = self.state();
        let current = thread::current().id();
        match state.owner {
            None => state.owner = Some(current),
            Some(owner) if owner != current => {
                tracing::error!(?owner, ?current, "reserve_all called off the GPU thread");
            }
            Some(_) => {}
        }
        tracing::debug!(resources = state.entries.len(), "reserving all resources");

        let mut slot = self.gpu();
        if slot.is_some() {
            tracing::warn!("replacing a backend that was never released");
        }
        let gpu = slot.insert(backend);

        let mut queued = std::mem::take(&mut state.reserve_queue);
        let mut dropped = Vec::new();
        for (key, entry) in state.entries.iter_mut() {
            entry.reserve(key, gpu.as_mut());
            if let Some(position) = queued
                .iter()
                .position(|(queued, pending)| queued == key && Arc::ptr_eq(pending, &entry.resource))
            {
                queued.swap_remove(position);
                entry.ref_count = entry.ref_count.saturating_sub(1);
                if entry.ref_count == 0 {
                    dropped.push(key.clone());
                }
            }
        }
        for key in dropped {
            if let Some(mut entry) = state.entries.remove(&key) {
                entry.release(&key, Some(gpu.as_mut()));
            }
        }
    }

    /// Releases every resource and hands back the backend. With
    /// [`ContextRelease::Lost`] no native teardown is issued. Also releases
    /// every pooled decoder and unbinds the GPU thread.
    pub fn release_all(&self, mode: ContextRelease) -> Option<Box<dyn GpuBackend>> {
        let snapshot = {
            let mut state = self.state();
            let Some(owner) = state.owner else {
                tracing::warn!("release_all called before any reserve_all");
                drop(state);
                self.decoders.release_all();
                return self.gpu().take();
            };
            if owner != thread::current().id() {
                tracing::error!(?owner, "release_all called off the GPU thread");
            }
            tracing::debug!(resources = state.entries.len(), ?mode, "releasing all resources");
            state.in_release = true;

            let mut snapshot = Vec::new();
            let queued: Vec<_> = state
                .entries
                .iter()
                .filter(|(key, entry)| state.is_queued(key, &entry.resource))
                .map(|(key, _)| key.clone())
                .collect();
            for (key, entry) in state.entries.iter_mut() {
                if entry.released {
                    if !queued.contains(key) {
                        tracing::error!(key = %key, "release called on a resource that is already released");
                    }
                    continue;
                }
                entry.released = true;
                snapshot.push((key.clone(), entry.resource.clone()));
            }
            snapshot
        };

        let mut backend = self.gpu().take();
        for (key, resource) in snapshot {
            tracing::trace!(key = %key, "releasing resource");
            let gpu = match mode {
                ContextRelease::Orderly => backend_mut(&mut backend),
                ContextRelease::Lost => None,
            };
            lock(&resource).release(gpu);
        }

        {
            let mut state = self.state();
            state.in_release = false;
            for key in std::mem::take(&mut state.remove_queue) {
                if state
                    .entries
                    .get(&key)
                    .is_some_and(|entry| entry.ref_count == 0)
                {
                    state.entries.remove(&key);
                }
            }
            for (key, pending) in std::mem::take(&mut state.reserve_queue) {
                let drop_entry = match state.entries.get_mut(&key) {
                    Some(entry) if Arc::ptr_eq(&entry.resource, &pending) => {
                        entry.ref_count = entry.ref_count.saturating_sub(1);
                        entry.ref_count == 0
                    }
                    _ => false,
                };
                if drop_entry {
                    state.entries.remove(&key);
                }
            }
            state.owner = None;
        }

        self.decoders.release_all();
        backend
    }

    /// Runs queued GPU events and reserves resources registered from other
    /// threads. Call once per frame on the GPU thread before drawing.
    pub fn predraw(&self) {
        let events = {
            let mut state = self.state();
            if !state.is_owner() {
                tracing::error!("predraw called off the GPU thread");
                return;
            }
            std::mem::take(&mut state.events)
        };
        if !events.is_empty() {
            let mut slot = self.gpu();
            match slot.as_deref_mut() {
                Some(gpu) => {
                    for event in events {
                        event(&mut *gpu);
                    }
                }
                None => tracing::warn!(dropped = events.len(), "no backend for queued GPU events"),
            }
        }

        let mut state = self.state();
        if state.reserve_queue.is_empty() {
            return;
        }
        let mut slot = self.gpu();
        let Some(gpu) = slot.as_deref_mut() else {
            return;
        };
        for (key, pending) in std::mem::take(&mut state.reserve_queue) {
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };
            if !Arc::ptr_eq(&entry.resource, &pending) {
                continue;
            }
            entry.reserve(&key, gpu);
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                if let Some(mut entry) = state.entries.remove(&key) {
                    entry.release(&key, Some(&mut *gpu));
                }
            }
        }
    }

    /// Runs `f` against the installed backend on the GPU thread.
    pub fn with_gpu<R>(&self, f: impl FnOnce(&mut dyn GpuBackend) -> R) -> Result<R, GpuError> {
        if !self.state().is_owner() {
            tracing::error!("GPU access off the GPU thread");
            return Err(GpuError::NoBackend);
        }
        let mut slot = self.gpu();
        let gpu = slot.as_deref_mut().ok_or(GpuError::NoBackend)?;
        Ok(f(gpu))
    }

    pub fn is_gpu_thread(&self) -> bool {
        self.state().is_owner()
    }

    pub fn has_backend(&self) -> bool {
        self.gpu().is_some()
    }

    /// Tears down an entry that just left the map. Native handles are only
    /// touched on the GPU thread; other threads hand the release over as a
    /// queued event.
    fn retire(&self, state: &mut CacheState, key: &str, mut entry: Entry) {
        state
            .reserve_queue
            .retain(|(queued, pending)| !(queued == key && Arc::ptr_eq(pending, &entry.resource)));
        if entry.released {
            return;
        }
        if state.is_owner() {
            let mut slot = self.gpu();
            entry.release(key, backend_mut(&mut slot));
            return;
        }
        tracing::debug!(key, "deferring release to the GPU thread");
        entry.released = true;
        let resource = entry.resource;
        state
            .events
            .push_back(Box::new(move |gpu: &mut dyn GpuBackend| lock(&resource).release(Some(gpu))));
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        lock(&self.state)
    }

    fn gpu(&self) -> MutexGuard<'_, Option<Box<dyn GpuBackend>>> {
        lock(&self.gpu)
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("ResourceCache")
            .field("entries", &state.entries.len())
            .field("queued", &state.reserve_queue.len())
            .field("owner", &state.owner)
            .finish()
    }
}

fn backend_mut(slot: &mut Option<Box<dyn GpuBackend>>) -> Option<&mut dyn GpuBackend> {
    match slot {
        Some(gpu) => Some(gpu.as_mut()),
        None => None,
    }
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
