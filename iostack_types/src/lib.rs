#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod device;
pub mod request;
pub mod status;

pub use device::{DeviceStack, Layer, LayerVerdict};
pub use request::{
    CancelFn, CancelState, CompletionAction, EvtFrameComplete, EvtRequestComplete, OperationKind,
    Request, RequestHandle, StackFrame,
};
pub use status::{ErrorKind, IoStatus};
