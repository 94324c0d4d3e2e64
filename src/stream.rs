//! Per-stream handles.
//!
//! A [`Stream`] is a thin handle: every call is a command to the
//! association driver, which owns the stream's reassembly queue and
//! outbound sequence numbers.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::association::{request, AssociationError, Command};
use crate::chunk::{DataChunk, PayloadProtocolIdentifier};
use crate::queue::InflightChunk;
use crate::reassembly::ReassemblyQueue;

/// Partial reliability policy of a stream (RFC 3758).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReliabilityType {
    /// Retransmit until acknowledged.
    #[default]
    Reliable,
    /// Give up after the given number of retransmissions.
    Rexmit,
    /// Give up once the message is older than the given number of
    /// milliseconds.
    Timed,
}

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Reading and writing allowed.
    Open,
    /// A local reset has been requested; writes fail, reads still drain.
    Closing,
    /// Reset in both directions, or never opened.
    Closed,
}

/// Handle to one stream of an association. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Stream {
    stream_id: u16,
    cmd_tx: mpsc::Sender<Command>,
}

impl Stream {
    pub(crate) fn new(stream_id: u16, cmd_tx: mpsc::Sender<Command>) -> Self {
        Self { stream_id, cmd_tx }
    }

    /// Stream identifier.
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Read the next message into `buf`. Returns `Ok(0)` once the peer has
    /// reset the stream and everything buffered has been read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, AssociationError> {
        self.read_ppi(buf).await.map(|(n, _)| n)
    }

    /// Like [`read`](Self::read), also returning the payload protocol
    /// identifier of the message.
    pub async fn read_ppi(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, PayloadProtocolIdentifier), AssociationError> {
        let stream_id = self.stream_id;
        let capacity = buf.len();
        let (data, ppi) = request(&self.cmd_tx, |reply| Command::Read {
            stream_id,
            capacity,
            reply,
        })
        .await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok((data.len(), ppi))
    }

    /// Queue a message with the stream's default PPI. Waits while the
    /// association's send buffer is full.
    pub async fn write(&self, data: &[u8]) -> Result<usize, AssociationError> {
        self.send(Bytes::copy_from_slice(data), None).await
    }

    /// Queue a message with an explicit PPI.
    pub async fn write_ppi(
        &self,
        data: &[u8],
        ppi: PayloadProtocolIdentifier,
    ) -> Result<usize, AssociationError> {
        self.send(Bytes::copy_from_slice(data), Some(ppi)).await
    }

    async fn send(
        &self,
        data: Bytes,
        ppi: Option<PayloadProtocolIdentifier>,
    ) -> Result<usize, AssociationError> {
        let stream_id = self.stream_id;
        request(&self.cmd_tx, |reply| Command::Write {
            stream_id,
            data,
            ppi,
            reply,
        })
        .await
    }

    /// Set ordering and partial reliability for messages written from now
    /// on. `value` is a retransmission count for [`ReliabilityType::Rexmit`]
    /// and milliseconds for [`ReliabilityType::Timed`].
    pub async fn set_reliability_params(
        &self,
        unordered: bool,
        reliability: ReliabilityType,
        value: u32,
    ) -> Result<(), AssociationError> {
        let stream_id = self.stream_id;
        request(&self.cmd_tx, |reply| Command::SetReliability {
            stream_id,
            unordered,
            reliability,
            value,
            reply,
        })
        .await
    }

    /// Reset the outgoing direction of the stream. Returns once the reset
    /// is queued; the stream reaches [`StreamStatus::Closed`] when the peer
    /// resets its side too.
    pub async fn close(&self) -> Result<(), AssociationError> {
        let stream_id = self.stream_id;
        request(&self.cmd_tx, |reply| Command::CloseStream { stream_id, reply }).await
    }

    /// Current lifecycle state. A stream of a closed association is
    /// [`StreamStatus::Closed`].
    pub async fn state(&self) -> StreamStatus {
        let stream_id = self.stream_id;
        request(&self.cmd_tx, |reply| Command::StreamStatus { stream_id, reply })
            .await
            .unwrap_or(StreamStatus::Closed)
    }

    /// Bytes written on this stream and not yet acknowledged.
    pub async fn buffered_amount(&self) -> usize {
        let stream_id = self.stream_id;
        request(&self.cmd_tx, |reply| Command::BufferedAmount { stream_id, reply })
            .await
            .unwrap_or(0)
    }
}

/// Driver-side state of a stream.
#[derive(Debug)]
pub(crate) struct StreamState {
    pub(crate) stream_id: u16,
    pub(crate) status: StreamStatus,
    pub(crate) reassembly: ReassemblyQueue,
    pub(crate) default_ppi: PayloadProtocolIdentifier,
    pub(crate) unordered: bool,
    pub(crate) reliability: ReliabilityType,
    pub(crate) reliability_value: u32,
    pub(crate) buffered_amount: usize,
    next_ssn: u16,
}

impl StreamState {
    pub(crate) fn new(stream_id: u16, default_ppi: PayloadProtocolIdentifier) -> Self {
        Self {
            stream_id,
            status: StreamStatus::Open,
            reassembly: ReassemblyQueue::new(stream_id),
            default_ppi,
            unordered: false,
            reliability: ReliabilityType::Reliable,
            reliability_value: 0,
            buffered_amount: 0,
            next_ssn: 0,
        }
    }

    /// Split a message into DATA chunks of at most `max_payload` bytes.
    /// TSNs are assigned when the chunks leave the pending queue.
    pub(crate) fn packetize(
        &mut self,
        data: &Bytes,
        ppi: PayloadProtocolIdentifier,
        max_payload: usize,
    ) -> Vec<DataChunk> {
        let max_payload = max_payload.max(1);
        let mut chunks = Vec::with_capacity(data.len().div_ceil(max_payload));
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + max_payload).min(data.len());
            chunks.push(DataChunk {
                tsn: 0,
                stream_id: self.stream_id,
                ssn: self.next_ssn,
                ppi,
                unordered: self.unordered,
                beginning_fragment: offset == 0,
                ending_fragment: end == data.len(),
                immediate_sack: false,
                user_data: data.slice(offset..end),
            });
            offset = end;
        }

        if !self.unordered {
            self.next_ssn = self.next_ssn.wrapping_add(1);
        }
        chunks
    }

    /// Whether the partial reliability policy gives up on `chunk`.
    pub(crate) fn abandons(&self, chunk: &InflightChunk, now: Instant) -> bool {
        match self.reliability {
            ReliabilityType::Reliable => false,
            ReliabilityType::Rexmit => chunk.nsent > self.reliability_value,
            ReliabilityType::Timed => {
                now.duration_since(chunk.since)
                    >= Duration::from_millis(u64::from(self.reliability_value))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packetize_fragments_and_ssn() {
        let mut s = StreamState::new(3, PayloadProtocolIdentifier::BINARY);
        let data = Bytes::from(vec![7u8; 2500]);
        let chunks = s.packetize(&data, PayloadProtocolIdentifier::BINARY, 1200);

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].beginning_fragment && !chunks[0].ending_fragment);
        assert!(!chunks[1].beginning_fragment && !chunks[1].ending_fragment);
        assert!(!chunks[2].beginning_fragment && chunks[2].ending_fragment);
        assert_eq!(chunks[2].user_data.len(), 100);
        assert!(chunks.iter().all(|c| c.ssn == 0 && c.stream_id == 3));

        let next = s.packetize(&Bytes::from_static(b"x"), PayloadProtocolIdentifier::BINARY, 1200);
        assert_eq!(next[0].ssn, 1);
    }

    #[test]
    fn test_unordered_does_not_advance_ssn() {
        let mut s = StreamState::new(1, PayloadProtocolIdentifier::STRING);
        s.unordered = true;
        s.packetize(&Bytes::from_static(b"a"), PayloadProtocolIdentifier::STRING, 1200);
        s.packetize(&Bytes::from_static(b"b"), PayloadProtocolIdentifier::STRING, 1200);
        s.unordered = false;
        let chunks = s.packetize(&Bytes::from_static(b"c"), PayloadProtocolIdentifier::STRING, 1200);
        assert_eq!(chunks[0].ssn, 0);
        assert!(!chunks[0].unordered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandonment_policies() {
        let mut s = StreamState::new(0, PayloadProtocolIdentifier::BINARY);
        let mut c = InflightChunk::new(DataChunk::default(), Instant::now());
        c.nsent = 2;
        assert!(!s.abandons(&c, Instant::now()));

        s.reliability = ReliabilityType::Rexmit;
        s.reliability_value = 2;
        assert!(!s.abandons(&c, Instant::now()));
        c.nsent = 3;
        assert!(s.abandons(&c, Instant::now()));

        s.reliability = ReliabilityType::Timed;
        s.reliability_value = 500;
        assert!(!s.abandons(&c, Instant::now()));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(s.abandons(&c, Instant::now()));
    }
}
