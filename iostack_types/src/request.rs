use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use strum::Display;

use crate::status::{ErrorKind, IoStatus};

/// Diagnostics-only request id source. Monotonic across the process.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read { offset: u64, len: usize },
    Write { offset: u64, len: usize },
    DeviceControl(u32),
    Create,
    Close,
    Custom(u32),
}

/// What a frame completion callback tells the dispatcher to do next.
pub enum CompletionAction {
    /// Keep propagating upward carrying this (terminal) status.
    Continue(IoStatus),
    /// The callback re-armed the request; the dispatcher resets the
    /// status to `Pending` and sends it back down from this layer.
    Resubmit,
}

/// Invoked exactly once, when the request exits the top of the stack.
pub type EvtRequestComplete = Box<dyn FnOnce(&IoStatus) + Send + Sync>;
/// Per-frame completion callback, registered before forwarding and
/// taken (at most once) during upward propagation.
pub type EvtFrameComplete =
    Box<dyn FnOnce(&mut Request, IoStatus) -> CompletionAction + Send + Sync>;
/// Cooperative cancel handler. The armed owner keeps the strong `Arc`;
/// the request only ever holds a `Weak` back-reference.
pub type CancelFn = dyn Fn(&RequestHandle) + Send + Sync;

/// Cancel protocol state, overlaid on `IoStatus`.
pub enum CancelState {
    NoHandler,
    Armed(Weak<CancelFn>),
    /// Cancellation was asked for while no handler was armed. Latched:
    /// it fires the moment a handler is next armed, or becomes a no-op
    /// once the request reaches a terminal state.
    Requested,
}

/// Per-layer view of a request.
///
/// `params` may differ from the frame above it: a layer translates the
/// operation before forwarding (byte offset to sector, say) by staging
/// the frame below.
pub struct StackFrame {
    pub params: Option<OperationKind>,
    pub completion: Option<EvtFrameComplete>,
}

impl StackFrame {
    #[inline]
    fn empty() -> Self {
        Self {
            params: None,
            completion: None,
        }
    }
}

/// One in-flight I/O operation.
///
/// Frames are indexed bottom-up: frame `depth - 1` belongs to the top
/// layer and `current_frame` decrements as the request moves downward.
/// Whoever holds the write guard owns the request; ownership transfers
/// (forward, complete, cancel) are serialized by that guard.
pub struct Request {
    pub id: u64,
    pub kind: OperationKind,
    pub data: Box<[u8]>,
    pub status: IoStatus,
    pub frames: Box<[StackFrame]>,
    pub current_frame: usize,
    pub cancel: CancelState,
    pub on_complete: Option<EvtRequestComplete>,
    pub finalized: bool,
}

impl Request {
    /// Allocate a request with one frame per stack layer, positioned at
    /// the top frame. The only failure is resource exhaustion.
    pub fn create(
        depth: usize,
        kind: OperationKind,
        data: Box<[u8]>,
        on_complete: Option<EvtRequestComplete>,
    ) -> Result<RequestHandle, ErrorKind> {
        assert!(depth > 0, "a device stack has at least one layer");

        let mut frames = Vec::new();
        frames
            .try_reserve_exact(depth)
            .map_err(|_| ErrorKind::OutOfMemory)?;
        for _ in 0..depth {
            frames.push(StackFrame::empty());
        }

        Ok(RequestHandle(Arc::new(RwLock::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            data,
            status: IoStatus::Pending,
            frames: frames.into_boxed_slice(),
            current_frame: depth - 1,
            cancel: CancelState::NoHandler,
            on_complete,
            finalized: false,
        }))))
    }

    /// The operation as seen by the layer owning frame `idx`. Frames
    /// that were never staged inherit the originating operation.
    #[inline]
    pub fn frame_kind(&self, idx: usize) -> OperationKind {
        self.frames[idx].params.unwrap_or(self.kind)
    }

    #[inline]
    pub fn current_kind(&self) -> OperationKind {
        self.frame_kind(self.current_frame)
    }

    /// Register the current frame's completion callback. Registering a
    /// second callback on the same frame before the first has fired is
    /// a contract violation.
    pub fn set_completion(&mut self, cb: EvtFrameComplete) {
        let idx = self.current_frame;
        let frame = &mut self.frames[idx];
        assert!(
            frame.completion.is_none(),
            "completion already registered on frame {} of request {}",
            idx,
            self.id
        );
        frame.completion = Some(cb);
    }

    /// Write the operation view the next lower layer will see. Only the
    /// owner of the current frame may stage the frame below it.
    pub fn stage_next(&mut self, params: OperationKind) {
        assert!(
            self.current_frame > 0,
            "request {} has no frame below the current one",
            self.id
        );
        self.frames[self.current_frame - 1].params = Some(params);
    }
}

/// Shared handle to a request. Cloning is cheap; the inner lock is the
/// single-owner transfer point.
#[derive(Clone)]
pub struct RequestHandle(Arc<RwLock<Request>>);

impl RequestHandle {
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Request> {
        self.0.read()
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Request> {
        self.0.write()
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.read().id
    }

    #[inline]
    pub fn status(&self) -> IoStatus {
        self.read().status
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.read().status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_read(depth: usize) -> RequestHandle {
        Request::create(
            depth,
            OperationKind::Read { offset: 0, len: 64 },
            Box::new([0u8; 64]),
            None,
        )
        .unwrap()
    }

    #[test]
    fn create_sizes_frames_to_depth_and_starts_at_top() {
        let handle = new_read(3);
        let guard = handle.read();
        assert_eq!(guard.frames.len(), 3);
        assert_eq!(guard.current_frame, 2);
        assert_eq!(guard.status, IoStatus::Pending);
    }

    #[test]
    fn ids_are_monotonic() {
        let a = new_read(1);
        let b = new_read(1);
        assert!(b.id() > a.id());
    }

    #[test]
    fn unstaged_frames_inherit_the_originating_kind() {
        let handle = new_read(2);
        let mut guard = handle.write();
        assert_eq!(guard.current_kind(), guard.kind);

        guard.stage_next(OperationKind::Read {
            offset: 8,
            len: 512,
        });
        assert_eq!(
            guard.frame_kind(0),
            OperationKind::Read {
                offset: 8,
                len: 512
            }
        );
    }

    #[test]
    #[should_panic(expected = "completion already registered")]
    fn double_completion_registration_panics() {
        let handle = new_read(2);
        let mut guard = handle.write();
        guard.set_completion(Box::new(|_, s| CompletionAction::Continue(s)));
        guard.set_completion(Box::new(|_, s| CompletionAction::Continue(s)));
    }

    #[test]
    #[should_panic(expected = "no frame below")]
    fn staging_below_the_bottom_panics() {
        let handle = new_read(1);
        handle.write().stage_next(OperationKind::Close);
    }
}
