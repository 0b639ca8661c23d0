use crate::buffer::BoundedChannel;
use crate::error::{PipelineError, Result};
use crate::metrics::{LogProgress, NodeMetrics, ProgressObserver};
use crate::node::{
    panic_message, FaultLatch, NodeContext, NodeRunner, NodeState, PipelineNode, StateCell,
};
use crate::propagation::CompletionPropagator;
use crate::sink::{BatchSink, Destination, ErrorRecord, DEFAULT_BATCH_SIZE};
use crate::stage::{Source, SourceNode, Transform, TransformNode};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Settings shared by every node the builder creates
#[derive(Clone)]
pub struct PipelineConfig {
    /// Capacity of channels created by the builder; `None` means unbounded
    pub channel_capacity: Option<usize>,
    /// Batch size for sinks added with `add_sink` that did not set one
    pub batch_size: usize,
    /// Receives `on_records_processed` events
    pub progress: Arc<dyn ProgressObserver>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: None,
            batch_size: DEFAULT_BATCH_SIZE,
            progress: Arc::new(LogProgress),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("channel_capacity", &self.channel_capacity)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

/// Builder for constructing pipelines
///
/// Each `add_*` call wires a node to the channels it is given and returns
/// the channel its output goes to.
pub struct PipelineBuilder {
    config: PipelineConfig,
    nodes: Vec<Box<dyn PipelineNode>>,
}

impl PipelineBuilder {
    /// Create a new pipeline builder
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
        }
    }

    /// Bound every channel the builder creates from here on
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = Some(capacity);
        self
    }

    /// Default batch size for sinks added with `add_sink`
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Report progress to `observer` instead of the log
    pub fn with_progress_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.config.progress = observer;
        self
    }

    /// Create a channel with the configured capacity
    pub fn channel<T>(&self) -> Result<BoundedChannel<T>> {
        match self.config.channel_capacity {
            Some(0) => Err(PipelineError::ConfigError(
                "channel capacity must be non-zero".into(),
            )),
            capacity => Ok(BoundedChannel::with_capacity(capacity)),
        }
    }

    /// Add a source and return its output channel
    pub fn add_source<S: Source>(&mut self, source: S) -> Result<BoundedChannel<S::Output>> {
        let output = self.channel()?;
        self.nodes
            .push(Box::new(SourceNode::new(source, output.clone())));
        Ok(output)
    }

    /// Add a transform reading from `input` and return its output channel
    pub fn add_transform<T: Transform>(
        &mut self,
        input: &BoundedChannel<T::Input>,
        transform: T,
    ) -> Result<BoundedChannel<T::Output>> {
        let output = self.channel()?;
        self.nodes.push(Box::new(TransformNode::new(
            transform,
            input.clone(),
            output.clone(),
        )));
        Ok(output)
    }

    /// Add a source whose rejected records go to a separate error channel.
    /// Returns the output and error channels.
    pub fn add_source_with_errors<S: Source>(
        &mut self,
        source: S,
    ) -> Result<(BoundedChannel<S::Output>, BoundedChannel<ErrorRecord<S::Output>>)> {
        let output = self.channel()?;
        let mut node = SourceNode::new(source, output.clone());
        let errors = node.attach_error_output();
        self.nodes.push(Box::new(node));
        Ok((output, errors))
    }

    /// Add a transform that redirects records it fails on instead of faulting.
    /// Returns the output and error channels.
    pub fn add_transform_with_errors<T>(
        &mut self,
        input: &BoundedChannel<T::Input>,
        transform: T,
    ) -> Result<(BoundedChannel<T::Output>, BoundedChannel<ErrorRecord<T::Input>>)>
    where
        T: Transform,
        T::Input: Clone,
    {
        let output = self.channel()?;
        let mut node = TransformNode::new(transform, input.clone(), output.clone());
        let errors = node.attach_error_output();
        self.nodes.push(Box::new(node));
        Ok((output, errors))
    }

    /// Add a batching sink
    pub fn add_sink<D: Destination>(&mut self, mut sink: BatchSink<D>) {
        sink.default_batch_size(self.config.batch_size);
        self.nodes.push(Box::new(sink));
    }

    /// Add an arbitrary node
    pub fn add_node(&mut self, node: impl PipelineNode) {
        self.nodes.push(Box::new(node));
    }

    /// Build the pipeline
    pub fn build(self) -> Result<Pipeline> {
        if self.nodes.is_empty() {
            return Err(PipelineError::NoNodes);
        }
        if self.config.channel_capacity == Some(0) {
            return Err(PipelineError::ConfigError(
                "channel capacity must be non-zero".into(),
            ));
        }
        if self.config.batch_size == 0 {
            return Err(PipelineError::ConfigError(
                "batch size must be non-zero".into(),
            ));
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name().to_string()) {
                return Err(PipelineError::ConfigError(format!(
                    "duplicate node name '{}'",
                    node.name()
                )));
            }
        }

        let entries = self
            .nodes
            .into_iter()
            .map(|node| {
                let metrics = NodeMetrics::with_observer(node.name(), Arc::clone(&self.config.progress));
                NodeEntry {
                    node,
                    metrics,
                    state: StateCell::new(),
                }
            })
            .collect();

        Ok(Pipeline { nodes: entries })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct NodeEntry {
    node: Box<dyn PipelineNode>,
    metrics: NodeMetrics,
    state: StateCell,
}

/// A wired pipeline, ready to run once
pub struct Pipeline {
    nodes: Vec<NodeEntry>,
}

impl Pipeline {
    /// Get metrics for a node by name
    pub fn node_metrics(&self, name: &str) -> Option<&NodeMetrics> {
        self.nodes
            .iter()
            .find(|entry| entry.metrics.node() == name)
            .map(|entry| &entry.metrics)
    }

    /// Names of all nodes, in the order they were added
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|e| e.metrics.node().to_string()).collect()
    }

    /// Run setup, stream every node and block until all are terminal.
    ///
    /// Returns the first fault any node reported.
    pub fn run(self) -> Result<()> {
        self.run_async()?.wait()
    }

    /// Run setup, then start every node's streaming phase and return without waiting
    pub fn run_async(mut self) -> Result<RunHandle> {
        self.setup_all()?;

        let count = self.nodes.len();
        info!(nodes = count, "starting pipeline");

        // Nodes reading the same channel share one counter of live readers
        let mut readers: HashMap<usize, Arc<AtomicUsize>> = HashMap::new();
        for entry in &self.nodes {
            if let Some(input) = entry.node.ports().input {
                readers
                    .entry(input.channel_id())
                    .or_default()
                    .fetch_add(1, Ordering::SeqCst);
            }
        }

        let faults = FaultLatch::new();
        let (report_tx, report_rx) = channel::unbounded();
        let mut handles = Vec::with_capacity(count);
        let mut nodes = Vec::with_capacity(count);

        for (index, entry) in self.nodes.into_iter().enumerate() {
            let NodeEntry {
                mut node,
                metrics,
                state,
            } = entry;
            let name = metrics.node().to_string();
            nodes.push(NodeHandle {
                name: name.clone(),
                metrics: metrics.clone(),
                state: state.clone(),
            });

            let ports = node.ports();
            let mut runner = NodeRunner::new(
                NodeContext::new(name.clone(), metrics),
                state,
                faults.clone(),
            );
            if let Some(live) = ports
                .input
                .as_ref()
                .and_then(|input| readers.get(&input.channel_id()))
            {
                runner = runner.with_input_readers(Arc::clone(live));
            }
            let report = Report {
                tx: report_tx.clone(),
                index,
            };

            let spawned = thread::Builder::new()
                .name(format!("node-{name}"))
                .spawn(move || {
                    let _report = report;
                    runner.run(node.as_mut())
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // The node never streams: fault both sides so its neighbours stop
                    // instead of waiting on it. The report guard was dropped with the
                    // closure, so this node already counts as terminal.
                    let err = PipelineError::ThreadError(format!(
                        "failed to spawn node '{name}': {err}"
                    ));
                    warn!(node = %name, error = %err, "spawn failed");
                    let cause = err.into_fault();
                    faults.record(&name, &cause);
                    if let Some(input) = &ports.input {
                        input.fault(Arc::clone(&cause));
                        if let Some(live) = readers.get(&input.channel_id()) {
                            live.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    CompletionPropagator::new(name.as_str(), ports.output, ports.error_output)
                        .propagate_fault(cause);
                    if let Some(last) = nodes.last() {
                        last.state.set(NodeState::Faulted);
                    }
                }
            }
        }

        Ok(RunHandle {
            handles,
            reports: report_rx,
            pending: count,
            faults,
            nodes,
            started: Instant::now(),
        })
    }

    fn setup_all(&mut self) -> Result<()> {
        for index in 0..self.nodes.len() {
            let node = &mut self.nodes[index].node;
            let result = panic::catch_unwind(AssertUnwindSafe(|| node.setup()));
            let name = node.name().to_string();
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(err @ PipelineError::Setup { .. })) => Some(err),
                Ok(Err(other)) => Some(PipelineError::Setup {
                    node: name.clone(),
                    reason: other.to_string(),
                }),
                Err(payload) => Some(PipelineError::Setup {
                    node: name.clone(),
                    reason: format!("panicked: {}", panic_message(payload)),
                }),
            };
            if let Some(err) = failure {
                warn!(node = %name, error = %err, "setup failed, aborting pipeline");
                self.abort_setup(index, &err);
                return Err(err);
            }
            self.nodes[index].state.set(NodeState::Initialized);
        }
        Ok(())
    }

    /// Fault every output so external readers wake, then clean up nodes that ran setup
    fn abort_setup(&mut self, failed: usize, err: &PipelineError) {
        let cause = Arc::new(match err {
            PipelineError::Setup { node, reason } => PipelineError::Setup {
                node: node.clone(),
                reason: reason.clone(),
            },
            other => PipelineError::StageError(other.to_string()),
        });
        for (index, entry) in self.nodes.iter_mut().enumerate() {
            let ports = entry.node.ports();
            CompletionPropagator::new(entry.node.name(), ports.output, ports.error_output)
                .propagate_fault(Arc::clone(&cause));
            if index <= failed {
                match panic::catch_unwind(AssertUnwindSafe(|| entry.node.cleanup())) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(node = entry.node.name(), error = %err, "cleanup failed"),
                    Err(payload) => warn!(
                        node = entry.node.name(),
                        message = %panic_message(payload),
                        "cleanup panicked"
                    ),
                }
            }
            entry.state.set(NodeState::Faulted);
        }
    }

    /// Get a summary of all metrics
    pub fn metrics_summary(&self) -> String {
        summarize(self.nodes.iter().map(|e| &e.metrics))
    }
}

fn summarize<'a>(metrics: impl Iterator<Item = &'a NodeMetrics>) -> String {
    let mut summary = String::from("Pipeline Metrics Summary:\n");
    for metrics in metrics {
        summary.push_str(&format!("  {}\n", metrics.snapshot().format()));
    }
    summary
}

/// Reports a node as terminal when dropped, even if its thread unwinds
struct Report {
    tx: Sender<usize>,
    index: usize,
}

impl Drop for Report {
    fn drop(&mut self) {
        let _ = self.tx.send(self.index);
    }
}

struct NodeHandle {
    name: String,
    metrics: NodeMetrics,
    state: StateCell,
}

/// A running pipeline.
///
/// Resolves once every node has reached a terminal state, to success or to
/// the first fault observed.
pub struct RunHandle {
    handles: Vec<JoinHandle<Result<()>>>,
    reports: Receiver<usize>,
    pending: usize,
    faults: FaultLatch,
    nodes: Vec<NodeHandle>,
    started: Instant,
}

impl RunHandle {
    /// Block until every node is terminal
    pub fn wait(mut self) -> Result<()> {
        while self.pending > 0 {
            match self.reports.recv() {
                Ok(_) => self.pending -= 1,
                Err(_) => break,
            }
        }
        self.finish()
    }

    /// Wait at most `timeout`; `None` if nodes are still running
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now() + timeout;
        while self.pending > 0 {
            match self.reports.recv_deadline(deadline) {
                Ok(_) => self.pending -= 1,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Some(self.outcome())
    }

    /// Check for completion without blocking
    pub fn try_wait(&mut self) -> Option<Result<()>> {
        while self.pending > 0 {
            match self.reports.try_recv() {
                Ok(_) => self.pending -= 1,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        Some(self.outcome())
    }

    /// Whether every node has reached a terminal state
    pub fn is_finished(&mut self) -> bool {
        self.try_wait().is_some()
    }

    /// Current state of every node, in the order they were added
    pub fn node_states(&self) -> Vec<(String, NodeState)> {
        self.nodes
            .iter()
            .map(|n| (n.name.clone(), n.state.get()))
            .collect()
    }

    /// Current state of one node
    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        self.nodes.iter().find(|n| n.name == name).map(|n| n.state.get())
    }

    /// Get metrics for a node by name
    pub fn node_metrics(&self, name: &str) -> Option<&NodeMetrics> {
        self.nodes.iter().find(|n| n.name == name).map(|n| &n.metrics)
    }

    /// Get a summary of all metrics
    pub fn metrics_summary(&self) -> String {
        summarize(self.nodes.iter().map(|n| &n.metrics))
    }

    fn outcome(&self) -> Result<()> {
        match self.faults.first() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn finish(mut self) -> Result<()> {
        let mut panicked = None;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                panicked = Some(PipelineError::ThreadError("node thread panicked".into()));
            }
        }
        info!(
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "pipeline finished"
        );
        match (self.outcome(), panicked) {
            (Err(err), _) => Err(err),
            (Ok(()), Some(err)) => Err(err),
            (Ok(()), None) => Ok(()),
        }
    }
}
