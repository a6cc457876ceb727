//! Fixed-ceiling parallel map over scoped threads.
//!
//! Used for both "several files of one job" and "several page chunks of one
//! file". Results keep their input index no matter which worker finishes
//! first, and a failing or panicking worker never disturbs its siblings.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
#[error("task {index} panicked: {message}")]
pub struct TaskPanicked {
    pub index: usize,
    pub message: String,
}

/// Runs `worker(item, index)` for every item with at most `limit` in flight.
///
/// Returns once every item has been attempted. Slot `i` of the result holds
/// the outcome for `items[i]`; a panic inside `worker` becomes
/// `Err(TaskPanicked)` in that slot only.
pub fn map_with_concurrency<T, R, F>(
    items: Vec<T>,
    limit: usize,
    worker: F,
) -> Vec<Result<R, TaskPanicked>>
where
    T: Send,
    R: Send,
    F: Fn(T, usize) -> R + Sync,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }
    let limit = limit.clamp(1, total);

    let queue: Vec<Mutex<Option<T>>> = items.into_iter().map(|t| Mutex::new(Some(t))).collect();
    let slots: Vec<Mutex<Option<Result<R, TaskPanicked>>>> =
        (0..total).map(|_| Mutex::new(None)).collect();
    let next = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..limit {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    if index >= total {
                        break;
                    }
                    let item = queue[index]
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .take();
                    let Some(item) = item else {
                        continue;
                    };
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker(item, index)))
                        .map_err(|payload| {
                            let message = panic_message(payload.as_ref());
                            warn!("task {index} panicked: {message}");
                            TaskPanicked { index, message }
                        });
                    *slots[index].lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
                }
            });
        }
    });

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.into_inner()
                .unwrap_or_else(|e| e.into_inner())
                .unwrap_or_else(|| {
                    Err(TaskPanicked {
                        index,
                        message: "task never ran".into(),
                    })
                })
        })
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
