//! # Execution Bridge
//!
//! Moves commands from the caller to the worker domain and back.
//!
//! - Commands with a pending native call run on the Tokio blocking pool.
//! - Every command then goes through the dispatch loop, a task on the
//!   runtime that created the client, which invokes completions.
//! - Topology events from the tend thread take the same route, so
//!   subscriber code also runs in the dispatch loop.
//!
//! Each submission carries a [`ReturnGate`]; the dispatch loop waits for it
//! before responding. The matching [`InvocationGuard`] lives in the public
//! method that issued the command and opens the gate when that method
//! returns, so no completion can fire while its initiating call is still on
//! the stack.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::command::Job;
use crate::events::EventMonitor;
use crate::native::cluster::{EventSink, NativeEvent};

/// Held by the issuing method; dropping it releases the response.
#[must_use = "the command responds as soon as the guard is dropped"]
pub(crate) struct InvocationGuard {
    _open: oneshot::Sender<()>,
}

/// Dispatch-side half of an [`InvocationGuard`].
pub(crate) struct ReturnGate {
    closed: oneshot::Receiver<()>,
}

impl ReturnGate {
    /// Resolves once the issuing method has returned.
    pub(crate) async fn wait(self) {
        // Nothing is ever sent; the sender being dropped is the signal.
        let _ = self.closed.await;
    }
}

pub(crate) fn invocation_gate() -> (InvocationGuard, ReturnGate) {
    let (tx, rx) = oneshot::channel();
    (InvocationGuard { _open: tx }, ReturnGate { closed: rx })
}

enum Dispatch {
    Respond { job: Box<dyn Job>, gate: ReturnGate },
    Topology(NativeEvent),
}

pub(crate) struct Bridge {
    runtime: Handle,
    tx: Mutex<Option<mpsc::UnboundedSender<Dispatch>>>,
}

impl Bridge {
    /// Spawns the dispatch loop on `runtime`.
    pub(crate) fn start(runtime: Handle, monitor: Arc<EventMonitor>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(dispatch_loop(rx, monitor));
        Arc::new(Bridge {
            runtime,
            tx: Mutex::new(Some(tx)),
        })
    }

    /// Hands a prepared command to the worker domain.
    pub(crate) fn submit(&self, mut job: Box<dyn Job>) -> InvocationGuard {
        let (guard, gate) = invocation_gate();
        job.queue();
        debug!(command = job.name(), state = ?job.state(), "submitting");

        let Some(tx) = self.tx.lock().clone() else {
            respond_detached(&self.runtime, job, gate);
            return guard;
        };

        if job.can_execute() {
            let runtime = self.runtime.clone();
            self.runtime.spawn_blocking(move || {
                job.execute();
                if let Err(mpsc::error::SendError(dispatch)) =
                    tx.send(Dispatch::Respond { job, gate })
                {
                    if let Dispatch::Respond { job, gate } = dispatch {
                        respond_detached(&runtime, job, gate);
                    }
                }
            });
        } else if let Err(mpsc::error::SendError(dispatch)) =
            tx.send(Dispatch::Respond { job, gate })
        {
            if let Dispatch::Respond { job, gate } = dispatch {
                respond_detached(&self.runtime, job, gate);
            }
        }
        guard
    }

    /// Sink handed to the native cluster; forwards events into the loop.
    pub(crate) fn event_sink(self: &Arc<Self>) -> EventSink {
        let bridge = Arc::downgrade(self);
        Arc::new(move |event: NativeEvent| {
            let Some(bridge) = bridge.upgrade() else {
                return;
            };
            let tx = bridge.tx.lock().clone();
            if let Some(tx) = tx {
                let _ = tx.send(Dispatch::Topology(event));
            }
        })
    }

    /// Stops accepting work. The loop ends once in-flight commands responded.
    pub(crate) fn shutdown(&self) {
        if self.tx.lock().take().is_some() {
            debug!("dispatch bridge shut down");
        }
    }
}

/// Responds outside the dispatch loop, still after the gate opened.
fn respond_detached(runtime: &Handle, mut job: Box<dyn Job>, gate: ReturnGate) {
    runtime.spawn(async move {
        gate.wait().await;
        job.respond();
    });
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Dispatch>, monitor: Arc<EventMonitor>) {
    while let Some(dispatch) = rx.recv().await {
        match dispatch {
            Dispatch::Respond { mut job, gate } => {
                gate.wait().await;
                job.respond();
            }
            Dispatch::Topology(event) => monitor.publish(event),
        }
    }
    debug!("dispatch loop stopped");
}
