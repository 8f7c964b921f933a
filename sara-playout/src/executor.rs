//! Mix callback executors
//!
//! Native trigger callbacks arrive on backend dispatch threads and must
//! not run next-item selection there. The executor decouples them: inline
//! when a UI dispatcher upstream already marshals, or a single worker
//! thread otherwise. The strategy choice never affects correctness, only
//! which thread does the selection work.

use crate::settings::MixExecutorKind;
use std::sync::Mutex;
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, warn};

type Job = Box<dyn FnOnce() + Send>;

enum ExecutorImpl {
    Inline,
    Worker { tx: Mutex<Option<mpsc::UnboundedSender<Job>>> },
}

/// Runs hand-off jobs according to the configured strategy
pub struct CallbackExecutor {
    imp: ExecutorImpl,
}

impl CallbackExecutor {
    pub fn new(kind: MixExecutorKind) -> Self {
        match kind {
            MixExecutorKind::Inline => Self {
                imp: ExecutorImpl::Inline,
            },
            MixExecutorKind::Worker => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                let spawned = thread::Builder::new()
                    .name("mix-executor".into())
                    .spawn(move || {
                        while let Some(job) = rx.blocking_recv() {
                            job();
                        }
                    });
                if let Err(e) = spawned {
                    error!("Failed to spawn mix executor, falling back to inline: {}", e);
                    return Self {
                        imp: ExecutorImpl::Inline,
                    };
                }
                Self {
                    imp: ExecutorImpl::Worker {
                        tx: Mutex::new(Some(tx)),
                    },
                }
            }
        }
    }

    /// Submit a job; inline strategy runs it on the caller thread.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.imp {
            ExecutorImpl::Inline => job(),
            ExecutorImpl::Worker { tx } => {
                let guard = tx.lock().unwrap();
                match guard.as_ref() {
                    Some(tx) => {
                        if tx.send(Box::new(job)).is_err() {
                            warn!("Mix executor worker is gone; job dropped");
                        }
                    }
                    None => warn!("Mix executor already shut down; job dropped"),
                }
            }
        }
    }

    /// Drop the worker channel so the thread drains and exits.
    pub fn shutdown(&self) {
        if let ExecutorImpl::Worker { tx } = &self.imp {
            tx.lock().unwrap().take();
        }
    }
}

impl Drop for CallbackExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
