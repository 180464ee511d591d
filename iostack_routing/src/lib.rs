#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod cancel;
pub mod routing;
pub mod work;

pub use iostack_types as types;

pub use cancel::{arm, disarm, request_cancel, CancelSafeQueue};
pub use routing::{complete_request, forward_to_next_lower, start_request, submit};
pub use work::{queue_work, run_global_once, WorkItem, WorkQueue, GLOBAL_WORK_QUEUE};
