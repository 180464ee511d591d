use strum::Display;

/// Completion state carried by every request.
///
/// A request starts `Pending` and transitions exactly once into one of
/// the terminal variants. Once terminal, the request is immutable and
/// eligible for disposal.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Pending,
    Success { bytes_transferred: u64 },
    Failed(ErrorKind),
    Cancelled,
}

impl IoStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IoStatus::Pending)
    }
}

/// Failure taxonomy reported through the completion path.
///
/// Contract violations (double finalize, double arm, completing with a
/// non-terminal status) are not represented here; they panic.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Allocation failed while creating a request. Reported
    /// synchronously by `Request::create`, never via a callback.
    OutOfMemory,
    /// The layer at the current frame does not service this operation
    /// kind.
    UnsupportedOperation,
    /// Device- or layer-specific failure.
    DeviceFailure(&'static str),
    /// A layer forwarded past the bottom of the stack.
    NoSuchLayer,
    /// The request was parked in a pending queue that was flushed.
    QueueTornDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_is_not_terminal() {
        assert!(!IoStatus::Pending.is_terminal());
    }

    #[test]
    fn all_other_variants_are_terminal() {
        assert!(IoStatus::Success {
            bytes_transferred: 0
        }
        .is_terminal());
        assert!(IoStatus::Failed(ErrorKind::UnsupportedOperation).is_terminal());
        assert!(IoStatus::Cancelled.is_terminal());
    }
}
