//! Deferred work queue: the "urgent enqueue, calmer drain" split.
//!
//! A layer's urgent notification path does the minimum and enqueues the
//! rest. `enqueue` is lock-free and never blocks, so it is safe from
//! the most constrained calling context. Draining is done by whatever
//! worker the host supplies (a thread calling [`WorkQueue::run_one`] in
//! a loop, an event-loop turn); this library spawns nothing.

use alloc::boxed::Box;
use alloc::sync::Arc;
use crossbeam_queue::SegQueue;
use iostack_types::device::DeviceStack;
use iostack_types::request::RequestHandle;
use iostack_types::status::{ErrorKind, IoStatus};
use lazy_static::lazy_static;
use log::{trace, warn};

use crate::routing::complete_request;

/// Deferred continuation of a request. Must not block; any error it
/// reports is converted into a failed completion rather than dropped.
pub type WorkFn = Box<dyn FnOnce(&RequestHandle) -> Result<(), ErrorKind> + Send>;

pub struct WorkItem {
    stack: Arc<DeviceStack>,
    request: RequestHandle,
    callback: WorkFn,
}

impl WorkItem {
    pub fn new(stack: Arc<DeviceStack>, request: RequestHandle, callback: WorkFn) -> Self {
        Self {
            stack,
            request,
            callback,
        }
    }
}

/// FIFO queue of deferred work. Multi-producer, multi-consumer; the
/// only cross-request ordering guarantee in the design is FIFO within
/// one of these.
pub struct WorkQueue {
    items: SegQueue<WorkItem>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            items: SegQueue::new(),
        }
    }

    /// Never blocks.
    pub fn enqueue(&self, item: WorkItem) {
        trace!("request {}: work deferred", item.request.id());
        self.items.push(item);
    }

    /// Pop and run one item. Returns whether an item ran. A callback
    /// error is converted into `Failed(kind)` on the captured request.
    pub fn run_one(&self) -> bool {
        let Some(item) = self.items.pop() else {
            return false;
        };

        trace!("request {}: deferred work running", item.request.id());
        if let Err(kind) = (item.callback)(&item.request) {
            warn!(
                "request {}: deferred work failed: {}",
                item.request.id(),
                kind
            );
            complete_request(&item.stack, &item.request, IoStatus::Failed(kind));
        }
        true
    }

    /// Run items until the queue is observed empty. Returns how many
    /// ran.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// Process-wide default queue, for hosts that run a single drain
    /// worker. Stacks that want isolation own their own `WorkQueue`.
    pub static ref GLOBAL_WORK_QUEUE: WorkQueue = WorkQueue::new();
}

pub fn queue_work(item: WorkItem) {
    GLOBAL_WORK_QUEUE.enqueue(item);
}

pub fn run_global_once() -> bool {
    GLOBAL_WORK_QUEUE.run_one()
}
