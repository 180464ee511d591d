//! Deferred completion through the work queue, and stack teardown
//! waiting on in-flight requests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use iostack_routing::routing::{complete_request, start_request};
use iostack_routing::work::{WorkItem, WorkQueue};
use iostack_types::device::{DeviceStack, Layer, LayerVerdict};
use iostack_types::request::{OperationKind, RequestHandle};
use iostack_types::status::IoStatus;

/// Urgent path does the minimum: capture the request, enqueue the rest.
struct DeferringLayer {
    queue: Arc<WorkQueue>,
}

impl Layer for DeferringLayer {
    fn name(&self) -> &str {
        "deferring"
    }
    fn handle(&self, stack: &Arc<DeviceStack>, request: &RequestHandle) -> LayerVerdict {
        let completer = stack.clone();
        self.queue.enqueue(WorkItem::new(
            stack.clone(),
            request.clone(),
            Box::new(move |handle| {
                complete_request(
                    &completer,
                    handle,
                    IoStatus::Success {
                        bytes_transferred: 64,
                    },
                );
                Ok(())
            }),
        ));
        LayerVerdict::Deferred
    }
}

#[test]
fn deferred_request_completes_on_drain() {
    let queue = Arc::new(WorkQueue::new());
    let stack = DeviceStack::assemble(vec![Arc::new(DeferringLayer {
        queue: queue.clone(),
    }) as Arc<dyn Layer>]);

    let fired = Arc::new(AtomicUsize::new(0));
    let handle = {
        let fired = fired.clone();
        start_request(
            &stack,
            OperationKind::Read { offset: 0, len: 64 },
            Box::new([0u8; 64]),
            Box::new(move |status| {
                assert_eq!(
                    *status,
                    IoStatus::Success {
                        bytes_transferred: 64
                    }
                );
                fired.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap()
    };

    // Nothing has drained the queue yet.
    assert_eq!(handle.status(), IoStatus::Pending);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(stack.in_flight(), 1);

    assert_eq!(queue.drain(), 1);

    assert!(handle.is_terminal());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(stack.in_flight(), 0);
}

#[test]
fn wait_idle_blocks_until_deferred_work_finishes() {
    let queue = Arc::new(WorkQueue::new());
    let stack = DeviceStack::assemble(vec![Arc::new(DeferringLayer {
        queue: queue.clone(),
    }) as Arc<dyn Layer>]);

    let statuses: Arc<Mutex<Vec<IoStatus>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..8u64 {
        let statuses = statuses.clone();
        start_request(
            &stack,
            OperationKind::Read {
                offset: i * 64,
                len: 64,
            },
            Box::new([0u8; 64]),
            Box::new(move |status| statuses.lock().unwrap().push(*status)),
        )
        .unwrap();
    }
    assert_eq!(stack.in_flight(), 8);

    let worker = {
        let queue = queue.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let mut drained = 0;
            while drained < 8 {
                if !queue.run_one() {
                    thread::yield_now();
                    continue;
                }
                drained += 1;
            }
        })
    };

    stack.wait_idle();

    assert_eq!(stack.in_flight(), 0);
    assert_eq!(statuses.lock().unwrap().len(), 8);
    worker.join().unwrap();
}
