//! Cooperative cancellation coordinator.
//!
//! Cancellation is a request, not a guarantee. A handler is armed by
//! whichever layer currently holds a pending request and disarmed when
//! that layer relinquishes it (forwards or completes). `request_cancel`
//! either fires the armed handler, or latches the ask for the next
//! handler to be armed, or no-ops on an already-terminal request.
//!
//! The handler races legitimately with real completion; both sides
//! resolve the race through `complete_request`'s first-terminal-writer
//! rule, so exactly one terminal status ever lands.

use alloc::collections::vec_deque::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use iostack_types::device::DeviceStack;
use iostack_types::request::{CancelFn, CancelState, RequestHandle};
use iostack_types::status::{ErrorKind, IoStatus};
use log::trace;
use spin::Mutex;

use crate::routing::complete_request;

/// Arm `handler` on a pending request. The caller keeps the strong
/// reference; the request records only a weak back-reference. If a
/// cancel was already latched, the handler fires before `arm` returns.
/// Arming an already-armed request is a contract violation. Arming a
/// terminal request is a no-op: there is nothing left to cancel.
pub fn arm(handle: &RequestHandle, handler: &Arc<CancelFn>) {
    let fire = {
        let mut guard = handle.write();
        if guard.status.is_terminal() {
            return;
        }
        match guard.cancel {
            CancelState::NoHandler => {
                guard.cancel = CancelState::Armed(Arc::downgrade(handler));
                false
            }
            CancelState::Armed(_) => {
                panic!("cancel handler armed twice on request {}", guard.id)
            }
            CancelState::Requested => {
                trace!("request {}: latched cancel firing on arm", guard.id);
                true
            }
        }
    };

    if fire {
        (**handler)(handle);
    }
}

/// Drop the armed handler, if any. Called by the owning layer right
/// before it forwards or completes the request. A latched `Requested`
/// stays latched.
pub fn disarm(handle: &RequestHandle) {
    let mut guard = handle.write();
    if let CancelState::Armed(_) = guard.cancel {
        guard.cancel = CancelState::NoHandler;
    }
}

/// Client-facing cancellation entry point.
pub fn request_cancel(handle: &RequestHandle) {
    let handler = {
        let mut guard = handle.write();
        if guard.status.is_terminal() {
            return;
        }
        match &guard.cancel {
            CancelState::Armed(weak) => {
                // A dead weak link means the owner dropped its handler;
                // fall back to the latch.
                let handler = weak.upgrade();
                guard.cancel = CancelState::Requested;
                handler
            }
            CancelState::NoHandler => {
                trace!("request {}: cancel latched, no handler armed", guard.id);
                guard.cancel = CancelState::Requested;
                None
            }
            CancelState::Requested => None,
        }
    };

    // Invoked outside the request lock: the handler re-enters through
    // complete_request and must be free to take the write guard.
    if let Some(handler) = handler {
        (*handler)(handle);
    }
}

/// Pending-request queue with cancellation handled by the queue itself.
///
/// `insert` parks a request and arms a handler that pulls it back out
/// and completes it `Cancelled`; `remove_next` disarms and hands the
/// request to its new owner. All synchronization between queue
/// manipulation, completion, and cancellation lives here, so layer
/// authors get safe parking without writing any of it.
pub struct CancelSafeQueue {
    // Ids are captured at insert time so removal never takes a request
    // lock while the queue mutex is held; layer hooks run under the
    // request's write guard and may touch this queue.
    inner: Arc<Mutex<VecDeque<(u64, RequestHandle)>>>,
    stack: Arc<DeviceStack>,
    canceller: Arc<CancelFn>,
}

impl CancelSafeQueue {
    pub fn new(stack: Arc<DeviceStack>) -> Self {
        let inner: Arc<Mutex<VecDeque<(u64, RequestHandle)>>> =
            Arc::new(Mutex::new(VecDeque::new()));

        let canceller: Arc<CancelFn> = {
            let inner = inner.clone();
            let stack = stack.clone();
            Arc::new(move |handle: &RequestHandle| {
                let id = handle.id();
                let removed = {
                    let mut queue = inner.lock();
                    let before = queue.len();
                    queue.retain(|&(parked_id, _)| parked_id != id);
                    before != queue.len()
                };
                // Lost to remove_next: the new owner observes the
                // latched cancel and resolves it cooperatively.
                if removed {
                    complete_request(&stack, handle, IoStatus::Cancelled);
                }
            })
        };

        Self {
            inner,
            stack,
            canceller,
        }
    }

    /// Park a pending request. If a cancel was already latched on it,
    /// the request is cancelled before `insert` returns.
    pub fn insert(&self, handle: RequestHandle) {
        let id = handle.id();
        self.inner.lock().push_back((id, handle.clone()));
        arm(&handle, &self.canceller);
    }

    /// Take the oldest parked request, disarmed, ownership transferred
    /// to the caller.
    pub fn remove_next(&self) -> Option<RequestHandle> {
        let (_, handle) = self.inner.lock().pop_front()?;
        disarm(&handle);
        Some(handle)
    }

    /// Teardown: fail everything still parked. Requests leave through
    /// the normal completion path so clients are never left unresolved.
    pub fn flush(&self) {
        let parked: Vec<RequestHandle> = {
            let mut queue = self.inner.lock();
            queue.drain(..).map(|(_, handle)| handle).collect()
        };
        for handle in parked {
            disarm(&handle);
            complete_request(
                &self.stack,
                &handle,
                IoStatus::Failed(ErrorKind::QueueTornDown),
            );
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
