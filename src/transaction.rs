//! FIFO write serialization with concurrent reads.
//!
//! Every write enqueues onto a single background worker so that N concurrent
//! `put`/`update`/`delete` calls apply in submission order, while reads run
//! inline on the caller's thread and may overlap freely with each other.
//! Both modes share one [`Locker`], so a write still excludes all readers for
//! the duration of its work plus the commit that follows it.
//!
//! Grounded on the teacher's `os/threads.rs` single-worker dispatch shape,
//! adapted here into a persistent thread draining an `mpsc` queue instead of
//! a one-shot spawn per call, which is what gives submission-order FIFO
//! semantics without re-spawning per operation.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::backend::StorageBackend;
use crate::error::{Error, Result};
use crate::locker::Locker;
use crate::virtual_engine::VirtualEngine;

type Job = Box<dyn FnOnce() + Send>;

/// Serializes write work across callers while letting reads proceed
/// concurrently, and fires the virtual engine's debounced commit after every
/// successful write.
pub struct TransactionManager<B: StorageBackend> {
    lock: Arc<Locker<()>>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    virtual_engine: Arc<VirtualEngine<B>>,
}

impl<B: StorageBackend> TransactionManager<B> {
    pub fn new(virtual_engine: Arc<VirtualEngine<B>>) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::spawn(move || {
            for job in receiver {
                job();
            }
        });
        TransactionManager {
            lock: Arc::new(Locker::new(())),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            virtual_engine,
        }
    }

    /// Run `work` under shared (reader) access. May run concurrently with
    /// other reads, never with a write.
    pub fn read<T>(&self, work: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.lock.read();
        work()
    }

    /// Enqueue `work` behind every write submitted before it. Runs under
    /// exclusive access; on success, fires the virtual engine's debounced
    /// commit before releasing the lock.
    pub fn write<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::Closing)?;

        let (result_tx, result_rx) = mpsc::channel();
        let lock = Arc::clone(&self.lock);
        let virtual_engine = Arc::clone(&self.virtual_engine);
        let job: Job = Box::new(move || {
            let _guard = lock.write();
            let outcome = work().and_then(|value| {
                virtual_engine.commit_with_debounce()?;
                Ok(value)
            });
            let _ = result_tx.send(outcome);
        });

        sender.send(job).map_err(|_| Error::Closing)?;
        result_rx.recv().map_err(|_| Error::Closing)?
    }

    /// Stop accepting new writes and wait for the worker to drain. Idempotent.
    pub fn close(&self) {
        if let Some(sender) = self.sender.lock().unwrap().take() {
            drop(sender);
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
