//! Bounded, non-blocking front for a slow persistence sink.
//!
//! Records are handed to a writer thread through a bounded channel. When the
//! queue is full the record is dropped and counted, so a live feed never waits
//! on storage. Replays opt into backpressure instead and wait for room.
//! `flush` always blocks.

use crate::domain::error::BarsimError;
use crate::ports::sink_port::{PersistenceSink, Record};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

enum Command {
    Write(Record),
    Flush(SyncSender<Result<(), String>>),
}

pub struct QueuedSink {
    tx: Option<SyncSender<Command>>,
    worker: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    wait_when_full: bool,
}

impl QueuedSink {
    pub fn new(inner: Box<dyn PersistenceSink>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel::<Command>(capacity.max(1));
        let failed = Arc::new(AtomicU64::new(0));
        let worker_failed = Arc::clone(&failed);

        let worker = thread::spawn(move || {
            let mut inner = inner;
            for command in rx {
                match command {
                    Command::Write(record) => {
                        if let Err(e) = inner.append(&record) {
                            worker_failed.fetch_add(1, Ordering::Relaxed);
                            warn!(kind = record.kind(), error = %e, "persistence write failed");
                        }
                    }
                    Command::Flush(reply) => {
                        let _ = reply.send(inner.flush().map_err(|e| e.to_string()));
                    }
                }
            }
            if let Err(e) = inner.flush() {
                warn!(error = %e, "final persistence flush failed");
            }
            debug!("persistence writer stopped");
        });

        Self {
            tx: Some(tx),
            worker: Some(worker),
            dropped: Arc::new(AtomicU64::new(0)),
            failed,
            wait_when_full: false,
        }
    }

    /// Block `append` until the queue has room instead of dropping.
    pub fn with_backpressure(mut self) -> Self {
        self.wait_when_full = true;
        self
    }

    /// Records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records the inner sink rejected.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn writer_gone() -> BarsimError {
        BarsimError::Database {
            reason: "persistence writer thread has stopped".into(),
        }
    }
}

impl PersistenceSink for QueuedSink {
    fn append(&mut self, record: &Record) -> Result<(), BarsimError> {
        let tx = self.tx.as_ref().ok_or_else(Self::writer_gone)?;
        if self.wait_when_full {
            return tx
                .send(Command::Write(record.clone()))
                .map_err(|_| Self::writer_gone());
        }
        match tx.try_send(Command::Write(record.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(kind = record.kind(), dropped, "persistence queue full, record dropped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(Self::writer_gone()),
        }
    }

    fn flush(&mut self) -> Result<(), BarsimError> {
        let tx = self.tx.as_ref().ok_or_else(Self::writer_gone)?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        tx.send(Command::Flush(reply_tx))
            .map_err(|_| Self::writer_gone())?;
        reply_rx
            .recv()
            .map_err(|_| Self::writer_gone())?
            .map_err(|reason| BarsimError::Database { reason })
    }
}

impl Drop for QueuedSink {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("persistence writer panicked");
            }
        }
    }
}
