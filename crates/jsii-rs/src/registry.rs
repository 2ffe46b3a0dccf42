//! Bidirectional object registry.
//!
//! Binds kernel handles to host proxies and host objects to synthetic
//! handles. Proxies are cached weakly so a handle observed twice resolves to
//! the same proxy; dropping the last clone of a proxy queues a `del` that
//! the engine sends at its next acquisition. Nothing is ever written to the
//! kernel pipe from a destructor.

use crate::config::RegistryConfig;
use crate::engine::KernelSession;
use crate::value::{HostError, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// A callable host-originated object.
///
/// Implemented by generated binding classes (and tests) for objects the
/// kernel can call back into. Members receive a [`KernelSession`] so host
/// code can issue further kernel requests while the engine lock is held.
#[async_trait]
pub trait HostObject: Send + Sync {
    async fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
        kernel: &mut KernelSession<'_>,
    ) -> std::result::Result<Value, HostError> {
        let _ = (args, kernel);
        Err(HostError::new(format!("no such method: {}", method)))
    }

    async fn get(
        &self,
        property: &str,
        kernel: &mut KernelSession<'_>,
    ) -> std::result::Result<Value, HostError> {
        let _ = kernel;
        Err(HostError::new(format!("no such property: {}", property)))
    }

    async fn set(
        &self,
        property: &str,
        value: Value,
        kernel: &mut KernelSession<'_>,
    ) -> std::result::Result<(), HostError> {
        let _ = (value, kernel);
        Err(HostError::new(format!("no such property: {}", property)))
    }
}

struct ProxyShared {
    handle: String,
    interfaces: Vec<String>,
    registry: Weak<RegistryShared>,
    released: AtomicBool,
}

impl Drop for ProxyShared {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        // Host-originated handles are freed through the registry, not `del`.
        if self.handle.starts_with(RegistryConfig::HOST_HANDLE_PREFIX) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.forget_dead_proxy(&self.handle);
        }
    }
}

/// A host proxy standing in for a kernel object.
///
/// Clones share one registry entry; equality is proxy identity. The kernel
/// object is released when the last clone drops or on an explicit release.
#[derive(Clone)]
pub struct ObjRef {
    shared: Arc<ProxyShared>,
}

impl ObjRef {
    /// The kernel handle this proxy stands in for.
    pub fn handle(&self) -> &str {
        &self.shared.handle
    }

    /// Interfaces announced with the handle, if any.
    pub fn interfaces(&self) -> &[String] {
        &self.shared.interfaces
    }

    /// Whether the handle was minted by this registry for a host object.
    pub fn is_host(&self) -> bool {
        self.shared
            .handle
            .starts_with(RegistryConfig::HOST_HANDLE_PREFIX)
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for ObjRef {}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({})", self.shared.handle)
    }
}

struct HostEntry {
    object: Arc<dyn HostObject>,
    interfaces: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    proxies: HashMap<String, Weak<ProxyShared>>,
    host_objects: HashMap<String, HostEntry>,
    host_handles: HashMap<usize, String>,
}

struct RegistryShared {
    state: Mutex<RegistryState>,
    pending: Mutex<Vec<String>>,
    next_host_id: AtomicU64,
}

impl RegistryShared {
    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        // A poisoned lock only means a panicking thread was interrupted
        // mid-update; the maps themselves stay coherent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self, handle: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(handle.to_string());
    }

    fn unqueue(&self, handle: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|h| h != handle);
    }

    /// Called from proxy destructors. Removes the entry and queues a `del`
    /// only while the map still points at the dead proxy; if the handle was
    /// re-observed in the meantime, ownership has moved to the new proxy.
    fn forget_dead_proxy(&self, handle: &str) {
        let dead = {
            let mut state = self.lock_state();
            let dead = state
                .proxies
                .get(handle)
                .map(|weak| weak.strong_count() == 0)
                .unwrap_or(false);
            if dead {
                state.proxies.remove(handle);
            }
            dead
        };
        if dead {
            self.queue(handle);
        }
    }
}

/// Handle/proxy table shared by the engine, marshaler, and dispatcher.
pub struct ObjectRegistry {
    shared: Arc<RegistryShared>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                state: Mutex::new(RegistryState::default()),
                pending: Mutex::new(Vec::new()),
                // Counter starts away from zero so synthetic handles read
                // like kernel ones ("jsii@10001").
                next_host_id: AtomicU64::new(10001),
            }),
        }
    }

    /// Returns the proxy for a handle, constructing one on first observation.
    ///
    /// Re-receiving a handle yields the proxy already in circulation. Any
    /// deletion still queued for the handle is cancelled, since the kernel
    /// just proved the object is alive.
    pub fn resolve(&self, handle: &str, interfaces: &[String]) -> ObjRef {
        self.shared.unqueue(handle);
        let mut state = self.shared.lock_state();

        if let Some(existing) = state.proxies.get(handle).and_then(Weak::upgrade) {
            return ObjRef { shared: existing };
        }

        let shared = Arc::new(ProxyShared {
            handle: handle.to_string(),
            interfaces: interfaces.to_vec(),
            registry: Arc::downgrade(&self.shared),
            released: AtomicBool::new(false),
        });
        state.proxies.insert(handle.to_string(), Arc::downgrade(&shared));
        ObjRef { shared }
    }

    /// Registers a host object and returns its synthetic handle.
    ///
    /// Tracking the same object (by pointer identity) twice yields the same
    /// handle, so host object identity survives a round trip through the
    /// kernel.
    pub fn track(&self, object: Arc<dyn HostObject>, interfaces: &[String]) -> ObjRef {
        let key = Arc::as_ptr(&object) as *const () as usize;
        let mut state = self.shared.lock_state();

        let handle = match state.host_handles.get(&key) {
            Some(handle) => handle.clone(),
            None => {
                let id = self.shared.next_host_id.fetch_add(1, Ordering::SeqCst);
                let handle = format!("{}{}", RegistryConfig::HOST_HANDLE_PREFIX, id);
                state.host_objects.insert(
                    handle.clone(),
                    HostEntry {
                        object,
                        interfaces: interfaces.to_vec(),
                    },
                );
                state.host_handles.insert(key, handle.clone());
                handle
            }
        };

        if let Some(existing) = state.proxies.get(&handle).and_then(Weak::upgrade) {
            return ObjRef { shared: existing };
        }
        let shared = Arc::new(ProxyShared {
            handle: handle.clone(),
            interfaces: interfaces.to_vec(),
            registry: Arc::downgrade(&self.shared),
            released: AtomicBool::new(false),
        });
        state.proxies.insert(handle, Arc::downgrade(&shared));
        ObjRef { shared }
    }

    /// The host object registered under a synthetic handle.
    pub fn host_object(&self, handle: &str) -> Option<Arc<dyn HostObject>> {
        self.shared
            .lock_state()
            .host_objects
            .get(handle)
            .map(|entry| entry.object.clone())
    }

    /// The interfaces a host object was tracked under.
    pub fn host_interfaces(&self, handle: &str) -> Option<Vec<String>> {
        self.shared
            .lock_state()
            .host_objects
            .get(handle)
            .map(|entry| entry.interfaces.clone())
    }

    /// Releases a proxy: removes its entries and queues a `del` for
    /// kernel-owned handles. Safe to call more than once; only the first
    /// call has any effect.
    pub fn release(&self, objref: &ObjRef) {
        if self.begin_release(objref) && !objref.is_host() {
            self.shared.queue(objref.handle());
        }
    }

    /// Marks a proxy released and removes its entries without queueing a
    /// `del`, for callers that send the deletion themselves. Returns whether
    /// this call performed the release.
    pub(crate) fn begin_release(&self, objref: &ObjRef) -> bool {
        if objref.shared.released.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Host objects removed here must drop outside the lock: they may own
        // proxies whose destructors reach back into the registry.
        let _removed_host = {
            let mut state = self.shared.lock_state();
            let stale = state
                .proxies
                .get(objref.handle())
                .map(|weak| Weak::as_ptr(weak) == Arc::as_ptr(&objref.shared))
                .unwrap_or(false);
            if stale {
                state.proxies.remove(objref.handle());
            }
            if objref.is_host() {
                state.host_handles.retain(|_, h| h.as_str() != objref.handle());
                state.host_objects.remove(objref.handle())
            } else {
                None
            }
        };
        true
    }

    /// Drains the queued deletions. Called by the engine each time it
    /// acquires the request lock.
    pub(crate) fn take_pending(&self) -> Vec<String> {
        let mut pending = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *pending)
    }

    #[cfg(test)]
    fn pending_snapshot(&self) -> Vec<String> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
