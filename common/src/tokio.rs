// Thin tokio layer so services spawn named tasks through one place.

use std::future::Future;

pub use tokio::{
    select,
    sync::{mpsc, oneshot, Mutex, RwLock, Semaphore},
    task::{JoinError, JoinHandle},
    time::{interval, sleep, timeout},
};

/// Spawn a long-lived task with a name attached for log correlation.
pub fn spawn_task<F>(name: &'static str, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    log::trace!("spawning task {}", name);
    tokio::spawn(async move {
        let output = future.await;
        log::trace!("task {} exited", name);
        output
    })
}
