use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::utils::panic_message;

/// A unit of work run on the delivery context.
pub type DeliveryTask = Box<dyn FnOnce() + Send + 'static>;

/// The context that callbacks are notified on.
///
/// Tasks submitted from one thread must run in submission order.
pub trait DeliveryExecutor: Send + Sync + 'static {
    fn execute(&self, task: DeliveryTask);
}

/// A dedicated thread running [`DeliveryTask`]s one after another.
///
/// A panicking task is logged and does not stop the thread.
#[derive(Debug)]
pub struct DeliveryThread {
    sender: Mutex<Option<mpsc::UnboundedSender<DeliveryTask>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryThread {
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<DeliveryTask>();

        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            while let Some(task) = receiver.blocking_recv() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    tracing::error!(
                        panic = panic_message(&*payload),
                        "Delivery task panicked"
                    );
                }
            }
            tracing::debug!("Delivery thread stopped");
        })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stops accepting tasks and waits until all queued tasks ran.
    ///
    /// Tasks submitted afterwards are dropped without running.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());

        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        // a task shutting down its own thread cannot wait for itself
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("Delivery thread terminated abnormally");
        }
    }
}

impl DeliveryExecutor for DeliveryThread {
    fn execute(&self, task: DeliveryTask) {
        let sender = self.sender.lock();
        let sent = match sender.as_ref() {
            Some(sender) => sender.send(task).is_ok(),
            None => false,
        };
        if !sent {
            tracing::debug!("Dropping delivery task after shutdown");
        }
    }
}

impl Drop for DeliveryThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
