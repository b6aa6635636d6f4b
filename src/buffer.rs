use crate::config::StreamConfig;
use crate::error::{Result, StatsError};
use crate::record::{ColumnSchema, Record};
use crate::storage::{BackendRegistry, StorageBackend};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Buffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub pending: usize,
    pub flushed_records: usize,
    pub flushes: usize,
    pub failed_flushes: usize,
}

struct Pending {
    records: Vec<Record>,
    schema: ColumnSchema,
}

/// Per-stream record buffer with a batch-size flush policy
///
/// Appends may come from any number of tasks. Flushes of the same buffer
/// are serialized by `flush_gate`, held for the whole backend `save` and the
/// removal of the saved records. A failed save keeps the records pending.
pub struct StatsBuffer {
    name: String,
    batch_size: usize,

    backend: Arc<dyn StorageBackend>,

    pending: Mutex<Pending>,
    flush_gate: Mutex<()>,

    // Statistics
    flushed_records: AtomicUsize,
    flushes: AtomicUsize,
    failed_flushes: AtomicUsize,
}

impl StatsBuffer {
    pub fn new(name: impl Into<String>, backend: Arc<dyn StorageBackend>, batch_size: usize) -> Self {
        Self {
            name: name.into(),
            batch_size: batch_size.max(1),
            backend,
            pending: Mutex::new(Pending {
                records: Vec::new(),
                schema: ColumnSchema::new(),
            }),
            flush_gate: Mutex::new(()),
            flushed_records: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            failed_flushes: AtomicUsize::new(0),
        }
    }

    /// Build a buffer for a configured stream; no backend I/O happens here
    pub fn from_config(config: &StreamConfig, registry: &BackendRegistry) -> Result<Self> {
        let backend = registry.resolve_with(
            &config.connection_string,
            &config.table_name,
            config.driver_options(),
        )?;
        info!(
            "Stream '{}' -> {} table '{}' (batch size {})",
            config.name,
            backend.backend_type(),
            config.table_name,
            config.batch_size
        );
        Ok(Self::new(config.name.clone(), backend, config.batch_size))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Union of every column observed so far
    pub async fn schema(&self) -> ColumnSchema {
        self.pending.lock().await.schema.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.records.len()
    }

    /// Add a record and flush if the batch is full
    pub async fn append(&self, record: Record) -> Result<()> {
        {
            let mut pending = self.pending.lock().await;
            for widening in pending.schema.observe(&record)? {
                warn!(
                    "Stream '{}': column '{}' widened from {} to {}",
                    self.name, widening.column, widening.from, widening.to
                );
            }
            pending.records.push(record);
            debug!(
                "Stream '{}': {} of {} records pending",
                self.name,
                pending.records.len(),
                self.batch_size
            );
        }

        self.maybe_flush().await
    }

    /// Flush if at least `batch_size` records are pending
    pub async fn maybe_flush(&self) -> Result<()> {
        if self.pending_len().await < self.batch_size {
            return Ok(());
        }
        let _gate = self.flush_gate.lock().await;
        // Another task may have flushed while we waited for the gate
        self.flush_locked(self.batch_size).await
    }

    /// Persist everything pending, regardless of the batch size
    pub async fn flush(&self) -> Result<()> {
        let _gate = self.flush_gate.lock().await;
        self.flush_locked(1).await
    }

    /// Caller holds `flush_gate`
    async fn flush_locked(&self, threshold: usize) -> Result<()> {
        let (batch, schema) = {
            let pending = self.pending.lock().await;
            if pending.records.is_empty() || pending.records.len() < threshold {
                return Ok(());
            }
            (pending.records.clone(), pending.schema.clone())
        };

        debug!(
            "Stream '{}': flushing {} records to {}",
            self.name,
            batch.len(),
            self.backend.backend_type()
        );

        match self.backend.save(&batch, &schema).await {
            Ok(()) => {
                // Records appended during the save stay pending
                self.pending.lock().await.records.drain(..batch.len());
                self.flushed_records.fetch_add(batch.len(), Ordering::Relaxed);
                self.flushes.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Stream '{}': flushed {} records to {}",
                    self.name,
                    batch.len(),
                    self.backend.backend_type()
                );
                Ok(())
            }
            Err(e) => {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Stream '{}': flush of {} records failed, keeping them pending: {}",
                    self.name,
                    batch.len(),
                    e
                );
                Err(e)
            }
        }
    }

    /// Drain on shutdown, retrying transient backend failures
    pub async fn drain(&self, max_retries: u32) -> Result<()> {
        let _gate = self.flush_gate.lock().await;
        let (batch, schema) = {
            let pending = self.pending.lock().await;
            (pending.records.clone(), pending.schema.clone())
        };
        if batch.is_empty() {
            return Ok(());
        }

        self.backend
            .save_with_retry(&batch, &schema, max_retries)
            .await
            .inspect_err(|_| {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
            })?;

        self.pending.lock().await.records.drain(..batch.len());
        self.flushed_records.fetch_add(batch.len(), Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        info!("Stream '{}': drained {} records", self.name, batch.len());
        Ok(())
    }

    /// Read back everything the backend stores for this stream
    pub async fn load(&self) -> Result<Vec<Record>> {
        let schema = self.schema().await;
        self.backend.load(&schema).await
    }

    /// Like `load`, but fails if the backend has never stored anything
    pub async fn load_required(&self) -> Result<Vec<Record>> {
        if self.backend.stored_schema().await?.is_none() {
            return Err(StatsError::EmptyBackend(self.name.clone()));
        }
        self.load().await
    }

    /// Get statistics
    pub async fn stats(&self) -> BufferStats {
        BufferStats {
            pending: self.pending_len().await,
            flushed_records: self.flushed_records.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
        }
    }
}
