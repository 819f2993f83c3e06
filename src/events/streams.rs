use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Items carried by an [`EventStream`] report a kind for statistics
pub trait StreamItem: Clone + Send + 'static {
    fn kind(&self) -> &'static str;
}

/// Generic event stream with a bounded replay buffer
pub struct EventStream<T: StreamItem> {
    sender: broadcast::Sender<T>,
    buffer: Arc<Mutex<VecDeque<T>>>,
    buffer_size: usize,
    stats: Arc<Mutex<EventStreamStats>>,
}

/// Statistics for monitoring stream activity
#[derive(Debug, Clone, Default)]
pub struct EventStreamStats {
    pub events_published: u64,
    /// Published while nobody was subscribed; still buffered for replay
    pub events_unobserved: u64,
    pub type_counts: HashMap<String, u64>,
}

impl<T: StreamItem> EventStream<T> {
    /// Create a new event stream with specified capacity
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        info!(capacity, buffer_size, "Creating new event stream");
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(buffer_size))),
            buffer_size,
            stats: Arc::new(Mutex::new(EventStreamStats::default())),
        }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> Subscriber<T> {
        debug!("New subscriber registered to event stream");
        Subscriber {
            receiver: self.sender.subscribe(),
            buffer: Arc::clone(&self.buffer),
        }
    }

    /// Publish an event to all subscribers, returning how many received it.
    ///
    /// Publishing never blocks and never fails; an event nobody listens to
    /// is kept in the replay buffer only.
    pub fn publish(&self, event: T) -> usize {
        let kind = event.kind();
        self.buffer_event(event.clone());

        let receivers = self.sender.send(event).unwrap_or(0);

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.events_published += 1;
        if receivers == 0 {
            stats.events_unobserved += 1;
        }
        *stats.type_counts.entry(kind.to_string()).or_insert(0) += 1;

        trace!(kind, receivers, "Event published");
        receivers
    }

    /// Store an event in the buffer for replay
    fn buffer_event(&self, event: T) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push_back(event);
        while buffer.len() > self.buffer_size {
            buffer.pop_front();
        }
    }

    /// Get current statistics
    pub fn get_stats(&self) -> EventStreamStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reset statistics counters
    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = EventStreamStats::default();
        debug!("Event stream statistics reset to defaults");
    }

    /// Get the buffer capacity
    pub fn capacity(&self) -> usize {
        self.buffer_size
    }
}

/// Subscriber for receiving events from a stream
pub struct Subscriber<T: StreamItem> {
    receiver: broadcast::Receiver<T>,
    buffer: Arc<Mutex<VecDeque<T>>>,
}

impl<T: StreamItem> Subscriber<T> {
    /// Receive the next event
    pub async fn recv(&mut self) -> Result<T, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Receive an event if one is ready
    pub fn try_recv(&mut self) -> Result<T, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Replay events from the buffer
    pub fn replay_buffer(&self) -> Vec<T> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.iter().cloned().collect()
    }
}

impl<T: StreamItem> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            buffer: Arc::clone(&self.buffer),
            buffer_size: self.buffer_size,
            stats: Arc::clone(&self.stats),
        }
    }
}
