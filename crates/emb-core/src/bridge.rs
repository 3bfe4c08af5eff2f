//! Running async workflows from synchronous entry points.
//!
//! Each call owns exactly one current-thread runtime for its whole duration. A
//! caller that is itself inside a tokio runtime gets the new runtime on a
//! scoped helper thread, so runtimes are never nested.

use std::{future::Future, panic, time::Duration};

use crate::{errors::Error, Result};

/// Drive `workflow` to completion, bounded by `timeout`.
///
/// The workflow's own output is returned unchanged (pass a `Result` through
/// to surface its errors). On timeout the runtime is shut down in the
/// background and abandoned work is dropped.
pub fn run_to_completion<F, T>(workflow: F, timeout: Duration) -> Result<T>
where
    F: Future<Output = T> + Send,
    T: Send,
{
    if tokio::runtime::Handle::try_current().is_err() {
        return drive(workflow, timeout);
    }

    tracing::debug!("bridge called inside a runtime, using a helper thread");
    std::thread::scope(|scope| {
        let handle = scope.spawn(move || drive(workflow, timeout));
        match handle.join() {
            Ok(out) => out,
            Err(payload) => panic::resume_unwind(payload),
        }
    })
}

fn drive<F, T>(workflow: F, timeout: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Io)?;

    let out = rt.block_on(async { tokio::time::timeout(timeout, workflow).await });
    match out {
        Ok(value) => Ok(value),
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "workflow timed out");
            rt.shutdown_background();
            Err(Error::Timeout(timeout))
        }
    }
}
