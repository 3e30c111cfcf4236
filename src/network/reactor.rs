//! Dedicated I/O worker thread hosting the async runtime
//!
//! Every socket and timer in the core runs on one current-thread tokio
//! runtime. Other threads hand it work through its [`Handle`]; tasks from
//! one producer run in submission order.

use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam_channel::bounded;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};

pub struct Reactor {
    handle: Handle,
    shutdown: watch::Sender<bool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Spawn the worker thread and block until its runtime is ready
    pub fn start(name: &str) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded(1);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                });
                // dropping the runtime cancels every task still in flight
                debug!("reactor loop drained");
            })
            .map_err(|e| Error::Config(format!("Failed to spawn reactor thread: {e}")))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| Error::Config("Reactor thread exited during startup".to_string()))?
            .map_err(|e| Error::Config(format!("Failed to build runtime: {e}")))?;

        Ok(Self {
            handle,
            shutdown: shutdown_tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Join the worker thread without initiating shutdown
    pub fn wait(&self) {
        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    /// Cancel all work and join the worker
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.wait();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}
