//! An embeddable dataflow pipeline for moving records between sources,
//! transforms and destinations under bounded memory.
//!
//! Nodes are wired together with [`BoundedChannel`]s and each node streams on
//! its own thread. Completion and faults travel downstream with the data, so
//! a failure anywhere surfaces at [`Pipeline::run`] instead of being swallowed.
//!
//! # Features
//!
//! - Blocking bounded channels with completion and fault signals
//! - Two-phase execution: synchronous setup for every node, then streaming
//! - Batching sinks that redirect rejected records to an error channel
//! - CSV destination and named-field mapping between record shapes
//! - Per-node metrics and progress events
//!
//! # Example
//!
//! ```ignore
//! use dataflow_pipeline::{BatchSink, IterSource, Map, MemoryDestination, PipelineBuilder};
//!
//! let mut builder = PipelineBuilder::new().with_capacity(64);
//! let numbers = builder.add_source(IterSource::new("numbers", 1..=10))?;
//! let doubled = builder.add_transform(&numbers, Map::new("double", |n: i32| Ok(n * 2)))?;
//!
//! let destination = MemoryDestination::new("memory");
//! let records = destination.records();
//! builder.add_sink(BatchSink::new(&doubled, destination).with_batch_size(4));
//!
//! builder.build()?.run()?;
//! assert_eq!(records.lock().len(), 10);
//! ```

pub mod buffer;
pub mod csv_destination;
pub mod error;
pub mod mapping;
pub mod metrics;
pub mod node;
pub mod pipeline;
pub mod propagation;
pub mod sink;
pub mod stage;

// Re-exports for convenience
pub use buffer::{BoundedChannel, ChannelSignal};
pub use csv_destination::CsvDestination;
pub use error::{BoxError, FaultCause, PipelineError, Result};
pub use mapping::{
    ArrayMapper, ColumnMapping, FieldMapTransform, FieldMapper, FieldValue, ObjectMapper,
    SerdeMapper,
};
pub use metrics::{LogProgress, MetricsSnapshot, NodeMetrics, ProgressObserver};
pub use node::{NodeContext, NodeRunner, NodeState, PipelineNode, Ports};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineConfig, RunHandle};
pub use propagation::{CompletionPropagator, Propagated};
pub use sink::{BatchSink, Destination, ErrorRecord, FlushError, MemoryDestination, DEFAULT_BATCH_SIZE};
pub use stage::{
    Emitter, Filter, IterSource, Map, Passthrough, Source, SourceNode, Transform, TransformNode,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
