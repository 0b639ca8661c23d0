use crate::buffer::{BoundedChannel, ChannelSignal};
use crate::error::{FaultCause, PipelineError, Result};
use crate::metrics::NodeMetrics;
use crate::propagation::CompletionPropagator;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle of a node within one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Initialized,
    Running,
    Completed,
    Faulted,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Faulted)
    }
}

/// Shared view of a node's current state
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<NodeState>>);

impl StateCell {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(NodeState::Created)))
    }

    pub fn get(&self) -> NodeState {
        *self.0.lock()
    }

    pub(crate) fn set(&self, state: NodeState) {
        *self.0.lock() = state;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Records the first fault of a run, across all nodes
#[derive(Debug, Clone, Default)]
pub struct FaultLatch(Arc<Mutex<Option<(String, FaultCause)>>>);

impl FaultLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `cause` unless a fault was already recorded. Returns true if stored.
    pub fn record(&self, node: &str, cause: &FaultCause) -> bool {
        let mut first = self.0.lock();
        if first.is_some() {
            return false;
        }
        *first = Some((node.to_string(), Arc::clone(cause)));
        true
    }

    /// The first recorded fault as the error a run surfaces
    pub fn first(&self) -> Option<PipelineError> {
        self.0
            .lock()
            .as_ref()
            .map(|(node, cause)| PipelineError::NodeFaulted {
                node: node.clone(),
                cause: Arc::clone(cause),
            })
    }
}

/// The channels a node is wired to, type-erased for signal propagation
#[derive(Default)]
pub struct Ports {
    pub input: Option<Box<dyn ChannelSignal>>,
    pub output: Option<Box<dyn ChannelSignal>>,
    pub error_output: Option<Box<dyn ChannelSignal>>,
}

impl Ports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input<T: Send + 'static>(mut self, channel: &BoundedChannel<T>) -> Self {
        self.input = Some(Box::new(channel.clone()));
        self
    }

    pub fn output<T: Send + 'static>(mut self, channel: &BoundedChannel<T>) -> Self {
        self.output = Some(Box::new(channel.clone()));
        self
    }

    pub fn error_output<T: Send + 'static>(mut self, channel: Option<&BoundedChannel<T>>) -> Self {
        self.error_output = channel.map(|c| Box::new(c.clone()) as Box<dyn ChannelSignal>);
        self
    }
}

impl fmt::Debug for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ports")
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .field("error_output", &self.error_output.is_some())
            .finish()
    }
}

/// What a node sees while streaming
#[derive(Debug, Clone)]
pub struct NodeContext {
    name: String,
    metrics: NodeMetrics,
}

impl NodeContext {
    pub fn new(name: impl Into<String>, metrics: NodeMetrics) -> Self {
        Self {
            name: name.into(),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }
}

/// A unit of the pipeline graph.
///
/// Channels are injected when the node is constructed; `ports` reports them
/// so the runner can propagate terminal signals. `setup` runs synchronously
/// for every node before any `stream_main` starts.
pub trait PipelineNode: Send + 'static {
    /// Diagnostic name, unique within a pipeline
    fn name(&self) -> &str;

    /// The channels this node reads from and owns
    fn ports(&self) -> Ports;

    /// Validate configuration and open resources required before streaming
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// The node's main loop; runs on its own thread
    fn stream_main(&mut self, ctx: &NodeContext) -> Result<()>;

    /// Release resources. Called exactly once after `stream_main` returns.
    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drives one node's streaming phase and its terminal protocol
pub struct NodeRunner {
    ctx: NodeContext,
    state: StateCell,
    faults: FaultLatch,
    input_readers: Option<Arc<AtomicUsize>>,
}

impl NodeRunner {
    /// Create a new node runner
    pub fn new(ctx: NodeContext, state: StateCell, faults: FaultLatch) -> Self {
        Self {
            ctx,
            state,
            faults,
            input_readers: None,
        }
    }

    /// Share the input with other nodes. `readers` counts the nodes still
    /// reading it; only the last one to stop discards what is left.
    pub fn with_input_readers(mut self, readers: Arc<AtomicUsize>) -> Self {
        self.input_readers = Some(readers);
        self
    }

    /// Get a reference to the metrics
    pub fn metrics(&self) -> &NodeMetrics {
        self.ctx.metrics()
    }

    /// Run the streaming phase to a terminal state.
    ///
    /// On exit the output and error output receive the node's terminal
    /// signal, cleanup runs, and any unread input is discarded so upstream
    /// producers can finish. Input shared with other running readers is left
    /// to them.
    pub fn run(&self, node: &mut dyn PipelineNode) -> Result<()> {
        let name = self.ctx.name().to_string();
        let ports = node.ports();
        let propagator = CompletionPropagator::new(name.as_str(), ports.output, ports.error_output);

        self.state.set(NodeState::Running);
        debug!(node = %name, "node started");

        let result = panic::catch_unwind(AssertUnwindSafe(|| node.stream_main(&self.ctx)))
            .unwrap_or_else(|payload| {
                Err(PipelineError::NodePanicked {
                    node: name.clone(),
                    message: panic_message(payload),
                })
            });

        let outcome = match result {
            Ok(()) => {
                propagator.propagate_completion();
                info!(
                    node = %name,
                    processed = self.ctx.metrics().total_processed(),
                    "node completed"
                );
                Ok(())
            }
            Err(err) => {
                let cause = err.into_fault();
                if self.faults.record(&name, &cause) {
                    error!(node = %name, error = %cause, "node faulted");
                } else {
                    debug!(node = %name, error = %cause, "node faulted after an earlier fault");
                }
                propagator.propagate_fault(Arc::clone(&cause));
                Err(PipelineError::NodeFaulted { node: name.clone(), cause })
            }
        };

        match panic::catch_unwind(AssertUnwindSafe(|| node.cleanup())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(node = %name, error = %err, "cleanup failed"),
            Err(payload) => warn!(
                node = %name,
                message = %panic_message(payload),
                "cleanup panicked"
            ),
        }

        if let Some(input) = ports.input {
            let last_reader = self
                .input_readers
                .as_ref()
                .map_or(true, |readers| readers.fetch_sub(1, Ordering::SeqCst) == 1);
            if last_reader {
                let discarded = input.discard_remaining();
                if discarded > 0 {
                    warn!(node = %name, discarded, "discarded unread input");
                }
            } else {
                debug!(node = %name, "leaving unread input to other readers");
            }
        }

        self.state.set(if outcome.is_ok() {
            NodeState::Completed
        } else {
            NodeState::Faulted
        });
        outcome
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
