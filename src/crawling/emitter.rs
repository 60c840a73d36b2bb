//! Emitter: hands finished records to the output collaborator exactly once.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashSet;
use thiserror::Error;
use tracing::info;

use crate::domain::{CanonicalRecord, ItemKey};

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("Item {0} was already emitted")]
    AlreadyEmitted(ItemKey),

    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Output collaborator (file, queue, database, ...)
pub trait RecordSink: Send + Sync {
    /// # Errors
    /// Returns [`EmitError`] when the record cannot be written.
    fn accept(&self, record: CanonicalRecord) -> Result<(), EmitError>;

    /// # Errors
    /// Returns [`EmitError`] when buffered output cannot be flushed.
    fn flush(&self) -> Result<(), EmitError> {
        Ok(())
    }
}

/// Collects records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<CanonicalRecord>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<CanonicalRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSink for MemorySink {
    fn accept(&self, record: CanonicalRecord) -> Result<(), EmitError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}

/// Writes one JSON document per line
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<BufWriter<W>>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
        }
    }

    /// Unwraps the underlying writer, flushing buffered lines first
    ///
    /// # Errors
    /// Returns [`EmitError::Io`] when the final flush fails.
    pub fn into_inner(self) -> Result<W, EmitError> {
        let writer = self.writer.into_inner().unwrap_or_else(PoisonError::into_inner);
        writer.into_inner().map_err(|e| EmitError::Io(e.into_error()))
    }
}

impl JsonLinesSink<File> {
    /// Creates (or truncates) `path`
    ///
    /// # Errors
    /// Returns [`EmitError::Io`] when the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, EmitError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn accept(&self, record: CanonicalRecord) -> Result<(), EmitError> {
        let line = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), EmitError> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }
}

/// Releases each item to the sink at most once
pub struct Emitter {
    sink: Arc<dyn RecordSink>,
    emitted: DashSet<ItemKey>,
    count: AtomicUsize,
}

impl Emitter {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self {
            sink,
            emitted: DashSet::new(),
            count: AtomicUsize::new(0),
        }
    }

    /// A key counts as emitted only once the sink accepted its record
    ///
    /// # Errors
    /// [`EmitError::AlreadyEmitted`] for a key seen before; sink errors otherwise.
    pub fn emit(&self, key: &ItemKey, record: CanonicalRecord) -> Result<(), EmitError> {
        if !self.emitted.insert(key.clone()) {
            return Err(EmitError::AlreadyEmitted(key.clone()));
        }
        if let Err(e) = self.sink.accept(record) {
            self.emitted.remove(key);
            return Err(e);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn emitted_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// # Errors
    /// Propagates the sink's flush error.
    pub fn finish(&self) -> Result<(), EmitError> {
        self.sink.flush()?;
        info!("📦 Emitter finished: {} records released", self.emitted_count());
        Ok(())
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("emitted", &self.emitted_count())
            .finish_non_exhaustive()
    }
}
