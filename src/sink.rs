//! Batching destinations.
//!
//! A [`BatchSink`] reads records from its input channel, groups them into
//! batches and hands each batch to a [`Destination`]. Records the destination
//! rejects individually go to the sink's error output when one is attached;
//! otherwise the first rejection faults the node.

use crate::buffer::BoundedChannel;
use crate::error::{BoxError, PipelineError, Result};
use crate::node::{NodeContext, PipelineNode, Ports};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{trace, warn};

/// Default number of records per batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Failure reported by `Destination::flush_batch`
#[derive(Debug, Error)]
pub enum FlushError {
    /// Record `index` of the slice could not be written. Records before it were written.
    #[error("record {index} could not be written: {source}")]
    Record {
        index: usize,
        #[source]
        source: BoxError,
    },

    /// The batch as a whole failed
    #[error("batch could not be written: {0}")]
    Batch(#[source] BoxError),
}

impl FlushError {
    pub fn record(index: usize, source: impl Into<BoxError>) -> Self {
        FlushError::Record {
            index,
            source: source.into(),
        }
    }

    pub fn batch(source: impl Into<BoxError>) -> Self {
        FlushError::Batch(source.into())
    }
}

/// An external target that records are written to in batches
pub trait Destination: Send + 'static {
    type Input: Send + 'static;

    /// Get a human-readable name for this destination
    fn name(&self) -> &str {
        "destination"
    }

    /// Validate that the target is configured. Must not perform I/O on the target.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Write `records` in order, opening the target on first use.
    ///
    /// On `FlushError::Record { index, .. }` the records before `index` must
    /// have been written and none after it attempted; the sink retries the
    /// remainder in a new call.
    fn flush_batch(&mut self, records: &[Self::Input]) -> std::result::Result<(), FlushError>;

    /// Flush and release the target
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A record the destination rejected, with the reason
#[derive(Debug)]
pub struct ErrorRecord<T> {
    pub record: T,
    pub error: PipelineError,
}

/// Accumulates records into batches and writes them to a destination
pub struct BatchSink<D: Destination> {
    destination: D,
    input: BoundedChannel<D::Input>,
    error_output: Option<BoundedChannel<ErrorRecord<D::Input>>>,
    batch_size: Option<usize>,
}

impl<D: Destination> BatchSink<D> {
    /// Create a sink reading from `input` with the default batch size
    pub fn new(input: &BoundedChannel<D::Input>, destination: D) -> Self {
        Self {
            destination,
            input: input.clone(),
            error_output: None,
            batch_size: None,
        }
    }

    /// Set the number of records per batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Use `batch_size` unless one was set explicitly
    pub(crate) fn default_batch_size(&mut self, batch_size: usize) {
        self.batch_size.get_or_insert(batch_size);
    }

    /// Redirect rejected records to `channel` instead of faulting
    pub fn with_error_output(mut self, channel: BoundedChannel<ErrorRecord<D::Input>>) -> Self {
        self.error_output = Some(channel);
        self
    }

    /// Attach an unbounded error output and return it
    pub fn attach_error_output(&mut self) -> BoundedChannel<ErrorRecord<D::Input>> {
        self.error_output
            .get_or_insert_with(BoundedChannel::unbounded)
            .clone()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    fn flush(&mut self, batch: Vec<D::Input>, ctx: &NodeContext) -> Result<()> {
        let started = Instant::now();
        let mut offset = 0;
        let mut written = 0u64;
        let mut rejected: Vec<(usize, PipelineError)> = Vec::new();

        while offset < batch.len() {
            match self.destination.flush_batch(&batch[offset..]) {
                Ok(()) => {
                    written += (batch.len() - offset) as u64;
                    break;
                }
                Err(FlushError::Record { index, source }) => {
                    let at = offset + index;
                    if at >= batch.len() {
                        return Err(PipelineError::BatchFatal {
                            node: ctx.name().to_string(),
                            source: format!(
                                "destination rejected record {index} of a {}-record slice",
                                batch.len() - offset
                            )
                            .into(),
                        });
                    }
                    written += index as u64;
                    let error = PipelineError::RecordWrite {
                        node: ctx.name().to_string(),
                        source,
                    };
                    if self.error_output.is_none() {
                        ctx.metrics().record_processed(written);
                        return Err(error);
                    }
                    warn!(node = ctx.name(), record = at, error = %error, "redirecting record");
                    rejected.push((at, error));
                    offset = at + 1;
                }
                Err(FlushError::Batch(source)) => {
                    return Err(PipelineError::BatchFatal {
                        node: ctx.name().to_string(),
                        source,
                    });
                }
            }
        }

        let metrics = ctx.metrics();
        metrics.record_flush(started.elapsed());
        metrics.record_processed(written);
        trace!(node = ctx.name(), written, rejected = rejected.len(), "flushed batch");

        if let Some(errors) = &self.error_output {
            if !rejected.is_empty() {
                metrics.record_redirected(rejected.len() as u64);
                let mut rejected = rejected.into_iter().peekable();
                for (index, record) in batch.into_iter().enumerate() {
                    match rejected.peek().map(|(at, _)| *at) {
                        Some(at) if at == index => {
                            if let Some((_, error)) = rejected.next() {
                                errors.put(ErrorRecord { record, error })?;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }
}

impl<D: Destination> PipelineNode for BatchSink<D> {
    fn name(&self) -> &str {
        self.destination.name()
    }

    fn ports(&self) -> Ports {
        Ports::new()
            .input(&self.input)
            .error_output(self.error_output.as_ref())
    }

    fn setup(&mut self) -> Result<()> {
        if self.batch_size() == 0 {
            return Err(PipelineError::Setup {
                node: self.name().to_string(),
                reason: "batch size must be non-zero".into(),
            });
        }
        self.destination.setup()
    }

    fn stream_main(&mut self, ctx: &NodeContext) -> Result<()> {
        let batch_size = self.batch_size();
        let mut batch = Vec::with_capacity(batch_size);
        while let Some(record) = self.input.take()? {
            batch.push(record);
            if batch.len() == batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                self.flush(full, ctx)?;
            }
        }
        if !batch.is_empty() {
            self.flush(batch, ctx)?;
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.destination.close()
    }
}

/// Destination that collects records in memory
pub struct MemoryDestination<T> {
    name: String,
    records: Arc<Mutex<Vec<T>>>,
}

impl<T> MemoryDestination<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the collected records
    pub fn records(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.records)
    }
}

impl<T: Clone + Send + 'static> Destination for MemoryDestination<T> {
    type Input = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn flush_batch(&mut self, records: &[T]) -> std::result::Result<(), FlushError> {
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}
