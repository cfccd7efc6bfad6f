use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cache::CacheKey;
use crate::encoder::GeneratedMeshDescriptor;
use crate::error::GenerationError;
use crate::evaluator::CancellationToken;
use crate::fingerprint::Fingerprint;
use crate::shape::ShapeKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity under which submissions supersede each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKey {
    /// Host scene object; edits to its footprint land in the same slot.
    Host(ShapeKey),
    /// Shape without a host key, identified by its content.
    Shape(Fingerprint),
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKey::Host(key) => write!(f, "object {}", key.0),
            SlotKey::Shape(fp) => write!(f, "shape {}", fp.short()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RequestState {
    pub fn is_active(self) -> bool {
        matches!(self, RequestState::Queued | RequestState::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

#[derive(Debug)]
struct Status {
    state: RequestState,
    descriptor: Option<Arc<GeneratedMeshDescriptor>>,
    from_cache: bool,
    error: Option<GenerationError>,
}

/// Shared state of one request, observed by its handle and driven by the
/// scheduler and the worker.
#[derive(Debug)]
pub(crate) struct RequestCell {
    status: Mutex<Status>,
    changed: Condvar,
}

impl RequestCell {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(Status {
                state: RequestState::Queued,
                descriptor: None,
                from_cache: false,
                error: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> RequestState {
        self.status.lock().state
    }

    /// Moves to `to` only from `from`. Returns whether the move happened.
    pub fn transition(&self, from: RequestState, to: RequestState) -> bool {
        let mut status = self.status.lock();
        if status.state != from {
            return false;
        }
        status.state = to;
        drop(status);
        self.changed.notify_all();
        true
    }

    /// Active to Cancelled; terminal states are left alone.
    pub fn cancel(&self) -> bool {
        let mut status = self.status.lock();
        if !status.state.is_active() {
            return false;
        }
        status.state = RequestState::Cancelled;
        drop(status);
        self.changed.notify_all();
        true
    }

    pub fn complete(&self, descriptor: Arc<GeneratedMeshDescriptor>, from_cache: bool) {
        let mut status = self.status.lock();
        status.state = RequestState::Completed;
        status.descriptor = Some(descriptor);
        status.from_cache = from_cache;
        drop(status);
        self.changed.notify_all();
    }

    pub fn fail(&self, error: GenerationError) {
        let mut status = self.status.lock();
        status.state = RequestState::Failed;
        status.error = Some(error);
        drop(status);
        self.changed.notify_all();
    }
}

/// A submitted generation: one shape and attribute set bound to a lifecycle.
#[derive(Debug, Clone)]
pub(crate) struct GenerationRequest {
    pub id: RequestId,
    pub slot: SlotKey,
    pub cache_key: CacheKey,
    pub token: CancellationToken,
    pub cell: Arc<RequestCell>,
}

impl GenerationRequest {
    pub fn new(id: RequestId, slot: SlotKey, cache_key: CacheKey) -> Self {
        Self {
            id,
            slot,
            cache_key,
            token: CancellationToken::new(),
            cell: Arc::new(RequestCell::new()),
        }
    }

    /// Signals the worker and marks the request Cancelled if it was still active.
    pub fn supersede(&self) -> bool {
        self.token.cancel();
        self.cell.cancel()
    }

    pub fn handle(&self) -> RequestHandle {
        RequestHandle {
            id: self.id,
            slot: self.slot,
            cache_key: self.cache_key,
            cell: Arc::clone(&self.cell),
        }
    }
}

/// Caller's view of a submitted request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: RequestId,
    slot: SlotKey,
    cache_key: CacheKey,
    cell: Arc<RequestCell>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn slot(&self) -> SlotKey {
        self.slot
    }

    pub fn cache_key(&self) -> CacheKey {
        self.cache_key
    }

    pub fn state(&self) -> RequestState {
        self.cell.state()
    }

    pub fn descriptor(&self) -> Option<Arc<GeneratedMeshDescriptor>> {
        self.cell.status.lock().descriptor.clone()
    }

    pub fn from_cache(&self) -> bool {
        self.cell.status.lock().from_cache
    }

    pub fn error(&self) -> Option<GenerationError> {
        self.cell.status.lock().error.clone()
    }

    /// Blocks until the request is terminal or `timeout` passes, and returns the
    /// state at that moment. Meant for tests and tools, never for a frame loop.
    pub fn wait_timeout(&self, timeout: Duration) -> RequestState {
        let deadline = Instant::now() + timeout;
        let mut status = self.cell.status.lock();
        while status.state.is_active() {
            if self.cell.changed.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        status.state
    }
}
