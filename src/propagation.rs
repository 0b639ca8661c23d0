//! Terminal-signal propagation from a node to its own outputs.
//!
//! A node's output channel and error channel reach the same terminal state as
//! the node itself. The runner calls the propagator only after the node's work
//! loop has exited, so consumers never observe completion while records the
//! node accepted are still in flight.

use crate::buffer::ChannelSignal;
use crate::error::FaultCause;
use parking_lot::Mutex;
use tracing::debug;

/// The terminal signal a propagator delivered
#[derive(Debug, Clone)]
pub enum Propagated {
    Completed,
    Faulted(FaultCause),
}

/// Delivers a node's terminal signal to its main and error outputs exactly once
pub struct CompletionPropagator {
    node: String,
    output: Option<Box<dyn ChannelSignal>>,
    error_output: Option<Box<dyn ChannelSignal>>,
    signaled: Mutex<Option<Propagated>>,
}

impl CompletionPropagator {
    /// Create a propagator for the given outputs
    pub fn new(
        node: impl Into<String>,
        output: Option<Box<dyn ChannelSignal>>,
        error_output: Option<Box<dyn ChannelSignal>>,
    ) -> Self {
        Self {
            node: node.into(),
            output,
            error_output,
            signaled: Mutex::new(None),
        }
    }

    /// Complete the output, then the error output.
    ///
    /// Returns false without touching any channel if a terminal signal was
    /// already propagated.
    pub fn propagate_completion(&self) -> bool {
        let mut signaled = self.signaled.lock();
        if signaled.is_some() {
            return false;
        }
        if let Some(output) = &self.output {
            output.complete();
        }
        if let Some(errors) = &self.error_output {
            errors.complete();
        }
        *signaled = Some(Propagated::Completed);
        debug!(node = %self.node, "propagated completion");
        true
    }

    /// Fault the output, then the error output, with the same cause
    pub fn propagate_fault(&self, cause: FaultCause) -> bool {
        let mut signaled = self.signaled.lock();
        if signaled.is_some() {
            return false;
        }
        if let Some(output) = &self.output {
            output.fault(FaultCause::clone(&cause));
        }
        if let Some(errors) = &self.error_output {
            errors.fault(FaultCause::clone(&cause));
        }
        debug!(node = %self.node, %cause, "propagated fault");
        *signaled = Some(Propagated::Faulted(cause));
        true
    }

    /// The signal delivered so far, if any
    pub fn propagated(&self) -> Option<Propagated> {
        self.signaled.lock().clone()
    }
}
