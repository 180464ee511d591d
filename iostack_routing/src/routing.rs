//! Request routing: downward dispatch, upward completion propagation,
//! finalization.
//!
//! The dispatcher never loops over layers on the way down. A layer that
//! decides to forward calls [`forward_to_next_lower`], which moves the
//! frame cursor and recursively submits, so the same call chain keeps
//! going down the stack and a layer may stage the frame below before
//! handing control down.

use alloc::boxed::Box;
use alloc::sync::Arc;
use iostack_types::device::{DeviceStack, LayerVerdict};
use iostack_types::request::{
    CancelState, CompletionAction, EvtRequestComplete, OperationKind, Request, RequestHandle,
};
use iostack_types::status::{ErrorKind, IoStatus};
use log::{debug, trace};

/// Client entry point: allocate a request against `stack` and submit it
/// at the top layer. `on_complete` fires exactly once, when the request
/// reaches a terminal state and exits the top of the stack.
///
/// The returned handle may already be terminal if the stack completed
/// synchronously.
pub fn start_request(
    stack: &Arc<DeviceStack>,
    kind: OperationKind,
    data: Box<[u8]>,
    on_complete: EvtRequestComplete,
) -> Result<RequestHandle, ErrorKind> {
    let handle = Request::create(stack.depth(), kind, data, Some(on_complete))?;
    stack.begin_io();
    trace!("request {}: {} submitted", handle.id(), kind);
    submit(stack, &handle);
    Ok(handle)
}

/// Hand the request to the layer at its current frame.
pub fn submit(stack: &Arc<DeviceStack>, handle: &RequestHandle) -> LayerVerdict {
    let (id, idx, kind) = {
        let guard = handle.read();
        debug_assert!(
            !guard.status.is_terminal(),
            "request {} submitted after completion",
            guard.id
        );
        (guard.id, guard.current_frame, guard.current_kind())
    };

    let layer = stack.layer(idx).clone();
    if !layer.handles_kind(&kind) {
        debug!(
            "request {}: {} unsupported by layer {} ({})",
            id,
            kind,
            idx,
            layer.name()
        );
        complete_request(
            stack,
            handle,
            IoStatus::Failed(ErrorKind::UnsupportedOperation),
        );
        return LayerVerdict::CompletedNow;
    }

    trace!("request {}: -> layer {} ({})", id, idx, layer.name());
    layer.handle(stack, handle)
}

/// Move the request one layer down and dispatch it there. A frame that
/// was never staged inherits the forwarding layer's view. Forwarding
/// off the bottom of the stack is a routing failure, not a panic.
pub fn forward_to_next_lower(stack: &Arc<DeviceStack>, handle: &RequestHandle) -> LayerVerdict {
    {
        let mut guard = handle.write();
        debug_assert!(
            !guard.status.is_terminal(),
            "request {} forwarded after completion",
            guard.id
        );

        if guard.current_frame == 0 {
            let id = guard.id;
            drop(guard);
            debug!("request {}: forwarded past the bottom layer", id);
            complete_request(stack, handle, IoStatus::Failed(ErrorKind::NoSuchLayer));
            return LayerVerdict::CompletedNow;
        }

        let inherited = guard.current_kind();
        guard.current_frame -= 1;
        let idx = guard.current_frame;
        if guard.frames[idx].params.is_none() {
            guard.frames[idx].params = Some(inherited);
        }
    }
    submit(stack, handle)
}

/// Drive the request to `status` and propagate completion back up the
/// stack.
///
/// The first terminal writer wins: a completion racing a cancellation
/// (or a second completion racing the first) is resolved under the
/// request's write guard and the loser is dropped. Reaching a terminal
/// state implicitly disarms any armed cancel handler; a latched
/// `Requested` stays latched so it survives a `Resubmit` and fires on
/// the next arm.
pub fn complete_request(stack: &Arc<DeviceStack>, handle: &RequestHandle, status: IoStatus) {
    assert!(
        status.is_terminal(),
        "completion must carry a terminal status, got {status}"
    );

    {
        let mut guard = handle.write();
        if guard.status.is_terminal() {
            trace!(
                "request {}: already {}, dropping late {}",
                guard.id,
                guard.status,
                status
            );
            return;
        }
        guard.status = status;
        if let CancelState::Armed(_) = guard.cancel {
            guard.cancel = CancelState::NoHandler;
        }
    }

    propagate(stack, handle);
}

/// Walk frames from the current one up to the top, invoking each
/// layer's `complete` hook and then the frame's registered completion
/// callback. Callbacks fire strictly in reverse forwarding order; the
/// last layer to forward is the first to observe completion.
fn propagate(stack: &Arc<DeviceStack>, handle: &RequestHandle) {
    let top = stack.top_index();
    loop {
        let (idx, action) = {
            let mut guard = handle.write();
            let idx = guard.current_frame;
            let layer = stack.layer(idx).clone();

            let status = guard.status;
            layer.complete(&mut *guard, &status);

            let status = guard.status;
            let action = match guard.frames[idx].completion.take() {
                Some(cb) => cb(&mut *guard, status),
                None => CompletionAction::Continue(status),
            };
            (idx, action)
        };

        match action {
            CompletionAction::Continue(status) => {
                assert!(
                    status.is_terminal(),
                    "completion callback returned non-terminal {status}"
                );
                let mut guard = handle.write();
                guard.status = status;
                if idx == top {
                    drop(guard);
                    finalize(stack, handle);
                    return;
                }
                guard.current_frame = idx + 1;
            }
            CompletionAction::Resubmit => {
                {
                    let mut guard = handle.write();
                    trace!("request {}: layer {} resubmitting", guard.id, idx);
                    guard.status = IoStatus::Pending;
                }
                submit(stack, handle);
                return;
            }
        }
    }
}

/// Invoke the client's callback exactly once and release the request's
/// slot in the stack's in-flight count. A second finalize on the same
/// request is a contract violation.
pub(crate) fn finalize(stack: &Arc<DeviceStack>, handle: &RequestHandle) {
    let (id, status, cb) = {
        let mut guard = handle.write();
        assert!(
            guard.status.is_terminal(),
            "request {} finalized while pending",
            guard.id
        );
        assert!(!guard.finalized, "request {} finalized twice", guard.id);
        guard.finalized = true;
        (guard.id, guard.status, guard.on_complete.take())
    };

    debug!("request {}: finalized with {}", id, status);
    if let Some(cb) = cb {
        cb(&status);
    }
    stack.end_io();
}
