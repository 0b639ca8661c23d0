use crate::error::{FaultCause, PipelineError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Terminal state of a channel
#[derive(Debug, Clone)]
enum Terminal {
    Open,
    Completed,
    Faulted(FaultCause),
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    terminal: Terminal,
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
    blocked_puts: AtomicU64,
}

/// An ordered, completion- and fault-aware queue connecting two nodes.
///
/// `put` blocks while the channel is full and `take` blocks while it is empty,
/// so a bounded channel is the backpressure point between a producer and its
/// consumers. Clones share the same queue.
pub struct BoundedChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BoundedChannel")
            .field("len", &state.items.len())
            .field("capacity", &self.shared.capacity)
            .field("terminal", &state.terminal)
            .finish()
    }
}

impl<T> BoundedChannel<T> {
    /// Create a channel holding at most `capacity` items
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be non-zero");
        Self::with_capacity(Some(capacity))
    }

    /// Create a channel that never blocks producers
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Create a channel from an optional bound
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        if let Some(0) = capacity {
            panic!("channel capacity must be non-zero");
        }
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity.unwrap_or(0).min(1024)),
                    terminal: Terminal::Open,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
                blocked_puts: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue an item, blocking while the channel is full.
    ///
    /// Fails with `ChannelFaulted` once the channel is faulted and with
    /// `ChannelClosed` once it is completed, including while waiting for space.
    pub fn put(&self, item: T) -> Result<()> {
        let mut state = self.shared.state.lock();
        let mut counted = false;
        loop {
            match &state.terminal {
                Terminal::Faulted(cause) => {
                    return Err(PipelineError::ChannelFaulted(Arc::clone(cause)))
                }
                Terminal::Completed => return Err(PipelineError::ChannelClosed),
                Terminal::Open => {}
            }
            match self.shared.capacity {
                Some(capacity) if state.items.len() >= capacity => {
                    if !counted {
                        self.shared.blocked_puts.fetch_add(1, Ordering::Relaxed);
                        counted = true;
                    }
                    self.shared.not_full.wait(&mut state);
                }
                _ => break,
            }
        }
        state.items.push_back(item);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the next item, blocking while the channel is empty and open.
    ///
    /// Returns `Ok(None)` once the channel is completed and drained, and the
    /// stored fault once it is faulted and drained.
    pub fn take(&self) -> Result<Option<T>> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Ok(Some(item));
            }
            if matches!(state.terminal, Terminal::Open) {
                self.shared.not_empty.wait(&mut state);
                continue;
            }
            return match &state.terminal {
                Terminal::Faulted(cause) => Err(PipelineError::ChannelFaulted(Arc::clone(cause))),
                _ => Ok(None),
            };
        }
    }

    /// Dequeue an item if one is buffered, without blocking
    pub fn try_take(&self) -> Option<T> {
        let item = self.shared.state.lock().items.pop_front();
        if item.is_some() {
            self.shared.not_full.notify_one();
        }
        item
    }

    /// Take every remaining item until the channel terminates
    pub fn collect(&self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.take()? {
            items.push(item);
        }
        Ok(items)
    }

    /// Mark that no more items will arrive. Returns false if already terminal.
    pub fn complete(&self) -> bool {
        self.terminate(Terminal::Completed)
    }

    /// Fault the channel. The first cause wins; returns false if already terminal.
    pub fn fault(&self, cause: FaultCause) -> bool {
        self.terminate(Terminal::Faulted(cause))
    }

    fn terminate(&self, terminal: Terminal) -> bool {
        let mut state = self.shared.state.lock();
        if !matches!(state.terminal, Terminal::Open) {
            return false;
        }
        state.terminal = terminal;
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        true
    }

    /// Whether `complete` or `fault` has been called
    pub fn is_terminated(&self) -> bool {
        !matches!(self.shared.state.lock().terminal, Terminal::Open)
    }

    /// The fault cause, if the channel was faulted
    pub fn fault_cause(&self) -> Option<FaultCause> {
        match &self.shared.state.lock().terminal {
            Terminal::Faulted(cause) => Some(Arc::clone(cause)),
            _ => None,
        }
    }

    /// Get the number of buffered items
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Check if the channel has no buffered items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the capacity, or `None` for an unbounded channel
    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    /// Get the utilization as a percentage (0-100); always 0 when unbounded
    pub fn utilization(&self) -> u32 {
        match self.shared.capacity {
            Some(capacity) => ((self.len() * 100 / capacity) as u32).min(100),
            None => 0,
        }
    }

    /// Get the number of puts that had to wait for space
    pub fn blocked_puts(&self) -> u64 {
        self.shared.blocked_puts.load(Ordering::Relaxed)
    }
}

/// Type-erased terminal signalling on a channel.
///
/// Nodes hand these out for the channels they own so that the runner can
/// propagate completion and faults without knowing the record types.
pub trait ChannelSignal: Send + Sync {
    /// Signal completion; false if the channel was already terminal
    fn complete(&self) -> bool;

    /// Signal a fault; false if the channel was already terminal
    fn fault(&self, cause: FaultCause) -> bool;

    /// Take and drop items until the channel terminates. Returns the count dropped.
    ///
    /// Every reader of the channel loses the dropped items, so only the last
    /// reader still attached should call this.
    fn discard_remaining(&self) -> usize;

    /// Identity of the underlying channel, shared by all of its clones
    fn channel_id(&self) -> usize;

    /// Whether the channel is terminal
    fn is_terminated(&self) -> bool;
}

impl<T: Send + 'static> ChannelSignal for BoundedChannel<T> {
    fn complete(&self) -> bool {
        BoundedChannel::complete(self)
    }

    fn fault(&self, cause: FaultCause) -> bool {
        BoundedChannel::fault(self, cause)
    }

    fn discard_remaining(&self) -> usize {
        let mut discarded = 0;
        while let Ok(Some(_)) = self.take() {
            discarded += 1;
        }
        discarded
    }

    fn is_terminated(&self) -> bool {
        BoundedChannel::is_terminated(self)
    }

    fn channel_id(&self) -> usize {
        Arc::as_ptr(&self.shared) as *const () as usize
    }
}
