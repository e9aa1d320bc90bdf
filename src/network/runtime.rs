//! The network thread
//!
//! Each manager owns one `NetworkRuntime`: a single-threaded tokio runtime that
//! is driven by a dedicated OS thread once started. All socket I/O and every
//! completion runs there. Work is posted through the runtime handle.

use std::future::Future;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;

/// Runtime errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to build tokio runtime: {0}")]
    Build(std::io::Error),

    #[error("Failed to spawn network thread: {0}")]
    Spawn(std::io::Error),

    #[error("Network thread already started")]
    AlreadyStarted,
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A tokio runtime waiting to be driven by its own thread
pub struct NetworkRuntime {
    name: String,
    handle: Handle,
    /// Present until `start` moves it onto the network thread
    runtime: Option<Runtime>,
    stop_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl NetworkRuntime {
    /// Build the runtime. No thread runs until `start`.
    pub fn new(name: impl Into<String>) -> RuntimeResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RuntimeError::Build)?;

        Ok(Self {
            name: name.into(),
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            stop_tx: None,
            thread: None,
        })
    }

    /// Handle used to post tasks onto the network thread
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Post a task. Tasks posted before `start` run once the thread starts.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run a future to completion on the calling thread.
    ///
    /// Only valid before `start`; used for setup work (resolve, bind) whose
    /// failure must be reported before any network thread exists. Must not be
    /// called from inside another tokio runtime.
    pub fn block_on<F: Future>(&self, future: F) -> RuntimeResult<F::Output> {
        match &self.runtime {
            Some(runtime) => Ok(runtime.block_on(future)),
            None => Err(RuntimeError::AlreadyStarted),
        }
    }

    /// Move the runtime onto a dedicated thread and start driving it
    pub fn start(&mut self) -> RuntimeResult<()> {
        let runtime = self.runtime.take().ok_or(RuntimeError::AlreadyStarted)?;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let name = self.name.clone();

        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                tracing::debug!("Network thread '{}' started", name);
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                // Outstanding tasks are dropped here, on this thread, before
                // the join in `stop` returns.
                drop(runtime);
                tracing::debug!("Network thread '{}' stopped", name);
            })
            .map_err(RuntimeError::Spawn)?;

        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);
        Ok(())
    }

    /// Whether the network thread has been started and not yet stopped
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stop the event loop and block until the network thread has exited
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Network thread '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for NetworkRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}
