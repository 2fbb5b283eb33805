//! Asynchronous utilities for use with Tokio.

pub mod io;

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
///
/// PDF generation and merging are CPU-bound, so we keep them off the async
/// executor with this.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}
