use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::request::{OperationKind, Request, RequestHandle};
use crate::status::IoStatus;

/// What a layer's `handle` did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerVerdict {
    /// The layer drove the request to a terminal state synchronously.
    CompletedNow,
    /// The layer handed the request to the next lower layer.
    Forwarded,
    /// The layer parked the request (work queue, pending queue); it
    /// completes later from another context.
    Deferred,
}

/// One stage of a device stack.
///
/// `handle` owns the request for the duration of the call and must end
/// it with exactly one of: completing it, forwarding it downward, or
/// deferring it. `complete` is invoked for every layer a completion
/// passes on its way back up, bottom-most first.
pub trait Layer: Send + Sync {
    fn name(&self) -> &str {
        "layer"
    }

    /// Operation kinds this layer services. The dispatcher completes
    /// anything else with `Failed(UnsupportedOperation)` without
    /// calling `handle`.
    fn handles_kind(&self, _kind: &OperationKind) -> bool {
        true
    }

    fn handle(&self, stack: &Arc<DeviceStack>, request: &RequestHandle) -> LayerVerdict;

    fn complete(&self, _request: &mut Request, _status: &IoStatus) {}
}

/// Ordered stack of layers, bottom (index 0) to top. The layer list is
/// fixed at assembly time and read-only afterwards; requests created
/// for a stack always carry exactly `depth()` frames.
pub struct DeviceStack {
    layers: Box<[Arc<dyn Layer>]>,
    in_flight: AtomicU64,
}

impl DeviceStack {
    /// Construction-time only. Layer order: bottom first.
    pub fn assemble(layers: Vec<Arc<dyn Layer>>) -> Arc<Self> {
        assert!(!layers.is_empty(), "a device stack has at least one layer");
        Arc::new(Self {
            layers: layers.into_boxed_slice(),
            in_flight: AtomicU64::new(0),
        })
    }

    /// Claim an in-flight slot for a newly submitted request.
    #[inline]
    pub fn begin_io(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Release the slot once the request is finalized. Must pair with a
    /// `begin_io`; an unpaired release would wrap the count and park
    /// `wait_idle` forever.
    #[inline]
    pub fn end_io(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "in-flight count underflowed");
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn top_index(&self) -> usize {
        self.layers.len() - 1
    }

    #[inline]
    pub fn layer(&self, idx: usize) -> &Arc<dyn Layer> {
        &self.layers[idx]
    }

    #[inline]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Block until every request submitted to this stack has reached a
    /// terminal state and run its final callback. Cancellation is a
    /// request, not a guarantee: a layer that swallows a request parks
    /// the caller here forever.
    pub fn wait_idle(&self) {
        while self.in_flight() != 0 {
            core::hint::spin_loop();
        }
    }
}
