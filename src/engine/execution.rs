//! The execution context
//!
//! All collaborator I/O (caches, LLM, retrieval, publishing) runs on one
//! dedicated OS thread driving a current-thread Tokio runtime. Bus delivery
//! threads never touch that runtime directly; they go through
//! [`ExecutionContext::run_blocking`], which schedules a future there and
//! waits for it with an explicit timeout.

use std::future::Future;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{AiModelError, Result};

pub struct ExecutionContext {
    name: String,
    handle: Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionContext {
    /// Spawn the execution thread and wait until its runtime is up.
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (handle_tx, handle_rx) = mpsc::channel::<std::result::Result<Handle, String>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| AiModelError::Internal("execution thread exited during startup".to_string()))?
            .map_err(AiModelError::Internal)?;

        info!(context = %name, "execution context started");
        Ok(Self {
            name,
            handle,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Fire-and-forget scheduling onto the execution context.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run `future` on the execution context and block the calling thread
    /// until it finishes or `timeout` elapses.
    ///
    /// On timeout the task is aborted and [`AiModelError::Timeout`] is
    /// returned. Must not be called from the execution thread itself.
    pub fn run_blocking<F, T>(&self, future: F, timeout: Duration) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::sync_channel(1);
        let task = self.handle.spawn(async move {
            let output = future.await;
            let _ = result_tx.send(output);
        });

        match result_rx.recv_timeout(timeout) {
            Ok(output) => Ok(output),
            Err(RecvTimeoutError::Timeout) => {
                task.abort();
                warn!(context = %self.name, ?timeout, "handoff timed out, task aborted");
                Err(AiModelError::Timeout(format!(
                    "execution context {} did not finish within {:?}",
                    self.name, timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(AiModelError::Internal(format!(
                "task on execution context {} ended without a result",
                self.name
            ))),
        }
    }

    /// Stop the runtime and join the thread. Outstanding tasks are cancelled.
    pub fn shutdown(&self) {
        if let Ok(mut shutdown) = self.shutdown.lock() {
            if let Some(sender) = shutdown.take() {
                let _ = sender.send(());
            }
        }
        if let Ok(mut thread) = self.thread.lock() {
            if let Some(thread) = thread.take() {
                // dropped from inside one of our own tasks; the runtime winds down on its own
                if thread.thread().id() == std::thread::current().id() {
                    return;
                }
                if thread.join().is_err() {
                    warn!(context = %self.name, "execution thread panicked");
                }
                debug!(context = %self.name, "execution context stopped");
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
