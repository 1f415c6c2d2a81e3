//! Fan-in of spawned tasks onto one bounded channel, closed after drain.
//!
//! Every task spawned through a [`FanIn`] holds a clone of the output sender
//! until it has delivered its result. [`FanIn::close`] drops the original
//! sender, so the receiver ends exactly when the last in-flight task has
//! finished: closure of the receiver means "fully drained".

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::RunnerError;

pub struct FanIn<T> {
    sender: Mutex<Option<mpsc::Sender<T>>>,
}

impl<T: Send + 'static> FanIn<T> {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Spawn `task`; its output is delivered on the receiver.
    pub fn spawn<F>(&self, task: F) -> Result<(), RunnerError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.spawn_with(|_| task)
    }

    /// Spawn a task that may also emit intermediate items through the
    /// sender it is given, before its final output.
    pub fn spawn_with<F, Fut>(&self, make_task: F) -> Result<(), RunnerError>
    where
        F: FnOnce(mpsc::Sender<T>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let tx = self.sender.lock().clone().ok_or(RunnerError::Closed)?;
        let task = make_task(tx.clone());
        tokio::spawn(async move {
            let output = task.await;
            // Receiver gone means nobody is interested any more.
            let _ = tx.send(output).await;
        });
        Ok(())
    }

    /// Refuse new tasks; the receiver ends once in-flight tasks are done.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}
