use std::collections::VecDeque;

use crate::chunk::DataChunk;

/// Outbound chunks waiting for a TSN.
///
/// Unordered chunks go first. Once the first fragment of a message is
/// popped the queue stays on that message's class until its last fragment,
/// so fragments of two messages are never interleaved.
///
/// Stream resets wait beside the data: a reset for a stream becomes ready
/// only once neither class holds a chunk of that stream, whichever class
/// the stream used when each message was written.
#[derive(Debug, Default)]
pub struct PendingQueue {
    ordered: VecDeque<DataChunk>,
    unordered: VecDeque<DataChunk>,
    /// `Some(unordered)` while a fragmented message is being drained.
    selected: Option<bool>,
    resets: VecDeque<u16>,
    n_bytes: usize,
}

impl PendingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a chunk.
    pub fn push(&mut self, c: DataChunk) {
        self.n_bytes += c.user_data.len();
        if c.unordered {
            self.unordered.push_back(c);
        } else {
            self.ordered.push_back(c);
        }
    }

    /// Queue all fragments of one message.
    pub fn append(&mut self, chunks: impl IntoIterator<Item = DataChunk>) {
        for c in chunks {
            self.push(c);
        }
    }

    /// The chunk `pop` would return.
    pub fn peek(&self) -> Option<&DataChunk> {
        match self.selected {
            Some(true) => self.unordered.front(),
            Some(false) => self.ordered.front(),
            None => self.unordered.front().or_else(|| self.ordered.front()),
        }
    }

    /// Take the next chunk.
    pub fn pop(&mut self) -> Option<DataChunk> {
        let unordered = match self.selected {
            Some(u) => u,
            None => !self.unordered.is_empty(),
        };
        let c = if unordered {
            self.unordered.pop_front()?
        } else {
            self.ordered.pop_front()?
        };

        if c.beginning_fragment && !c.ending_fragment {
            self.selected = Some(unordered);
        } else if c.ending_fragment {
            self.selected = None;
        }
        self.n_bytes -= c.user_data.len();
        Some(c)
    }

    /// Queue a reset of `stream_id` behind its queued data.
    pub fn push_reset(&mut self, stream_id: u16) {
        if !self.resets.contains(&stream_id) {
            self.resets.push_back(stream_id);
        }
    }

    /// Whether a reset of `stream_id` has not gone out yet.
    pub fn has_reset(&self, stream_id: u16) -> bool {
        self.resets.contains(&stream_id)
    }

    /// Take the oldest reset whose stream has no data left in the queue.
    pub fn pop_ready_reset(&mut self) -> Option<u16> {
        let idx = self
            .resets
            .iter()
            .position(|&stream_id| !self.holds_stream(stream_id))?;
        self.resets.remove(idx)
    }

    fn holds_stream(&self, stream_id: u16) -> bool {
        self.ordered
            .iter()
            .chain(self.unordered.iter())
            .any(|c| c.stream_id == stream_id)
    }

    /// Queued user bytes.
    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    /// Number of queued DATA chunks.
    pub fn len(&self) -> usize {
        self.ordered.len() + self.unordered.len()
    }

    /// Whether no DATA chunk is queued.
    pub fn has_no_data(&self) -> bool {
        self.ordered.is_empty() && self.unordered.is_empty()
    }

    /// Whether neither DATA nor a reset is queued.
    pub fn is_empty(&self) -> bool {
        self.has_no_data() && self.resets.is_empty()
    }
}
