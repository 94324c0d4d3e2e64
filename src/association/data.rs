//! DATA, SACK and FORWARD-TSN handling (RFC 4960 6, 7; RFC 3758).

use std::collections::{BTreeMap, HashMap};

use tokio::time::Instant;
use tracing::{debug, trace};

use super::config::AckMode;
use super::internal::AssociationInternal;
use super::{AssociationError, AssociationState};
use crate::chunk::{
    padded, Chunk, DataChunk, ErrorChunk, ForwardTsnChunk, ForwardTsnStream, SackChunk,
    PayloadProtocolIdentifier,
};
use crate::core::{
    sna16_lt, sna32_gt, sna32_gte, sna32_lt, sna32_lte, ACCEPT_QUEUE_SIZE, COMMON_HEADER_SIZE,
    DATA_CHUNK_HEADER_SIZE, FAST_RTX_THRESHOLD,
};
use crate::error_cause::ErrorCause;
use crate::packet::Packet;
use crate::queue::InflightChunk;
use crate::reassembly::ReassemblyQueue;
use crate::stream::StreamState;

impl AssociationInternal {
    pub(super) fn data_flows(&self) -> bool {
        matches!(
            self.state,
            AssociationState::Established
                | AssociationState::ShutdownPending
                | AssociationState::ShutdownSent
                | AssociationState::ShutdownReceived
        )
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    pub(super) fn handle_data(&mut self, data: DataChunk) {
        if !self.data_flows() {
            trace!(name = %self.name, state = %self.state, "ignoring DATA");
            return;
        }
        if data.user_data.is_empty() {
            self.abort(
                ErrorCause::no_user_data(data.tsn),
                AssociationError::ProtocolViolation(format!(
                    "DATA chunk {} without user data",
                    data.tsn
                )),
            );
            return;
        }

        let tsn = data.tsn;
        if sna32_gt(tsn, self.peer_last_tsn.wrapping_add(self.tsn_window())) {
            self.protocol_violation(&format!(
                "DATA TSN {tsn} beyond the receive window (cumulative TSN {})",
                self.peer_last_tsn
            ));
            return;
        }

        self.counters.datas_received += 1;
        // A SACK goes out at once when this chunk closes a gap.
        let had_gaps = !self.received.is_empty();
        let immediate = data.immediate_sack;

        if sna32_lte(tsn, self.peer_last_tsn) || self.received.contains(tsn) {
            self.received.push(tsn, self.peer_last_tsn);
        } else if self.receive_window() > 0 || self.received.fills_hole(tsn) {
            let len = data.user_data.len();
            let stream_id = data.stream_id;
            let accepted = match self.inbound_stream(stream_id) {
                Some(queue) => {
                    queue.push(data);
                    true
                }
                None => false,
            };
            if accepted {
                self.received.push(tsn, self.peer_last_tsn);
                self.counters.bytes_received += len as u64;
            } else {
                debug!(name = %self.name, stream_id, "accept queue full, dropping DATA");
            }
        } else {
            debug!(name = %self.name, tsn, "receive buffer full, dropping DATA");
        }

        self.advance_peer_last_tsn();
        let has_gaps = !self.received.is_empty();
        let has_dups = self.received.has_duplicates();
        self.schedule_sack(immediate || had_gaps || has_gaps || has_dups);
    }

    /// How far past the cumulative TSN new DATA may land. A peer that
    /// honours our window cannot get further ahead, and gap blocks cannot
    /// describe offsets past 16 bits.
    fn tsn_window(&self) -> u32 {
        self.config
            .max_receive_buffer_size
            .clamp(1, u32::from(u16::MAX))
    }

    /// Reassembly queue for an inbound stream, creating the stream (and
    /// announcing it to acceptors) on first use. `None` when the accept
    /// backlog is full.
    fn inbound_stream(&mut self, stream_id: u16) -> Option<&mut ReassemblyQueue> {
        if !self.streams.contains_key(&stream_id) {
            if self.accept_queue.len() >= ACCEPT_QUEUE_SIZE {
                return None;
            }
            debug!(name = %self.name, stream_id, "peer opened stream");
            self.streams.insert(
                stream_id,
                StreamState::new(stream_id, PayloadProtocolIdentifier::UNKNOWN),
            );
            self.accept_queue.push_back(stream_id);
        }
        self.streams.get_mut(&stream_id).map(|s| &mut s.reassembly)
    }

    pub(super) fn advance_peer_last_tsn(&mut self) {
        let before = self.peer_last_tsn;
        self.peer_last_tsn = self.received.advance(self.peer_last_tsn);
        if self.peer_last_tsn != before {
            self.perform_pending_reset_requests();
        }
    }

    /// Request a SACK now or arm the delayed-ack timer, per the ack mode.
    pub(super) fn schedule_sack(&mut self, immediate: bool) {
        let immediate = match self.config.ack_mode {
            AckMode::Normal => immediate,
            AckMode::NoDelay => true,
            AckMode::AlwaysDelay => false,
        };
        if immediate {
            self.ack_timer.stop();
            self.sack_needed = true;
        } else if !self.sack_needed {
            self.ack_timer.start();
        }
    }

    /// Receive credit left after what the streams are holding.
    pub(super) fn receive_window(&self) -> u32 {
        let held: usize = self
            .streams
            .values()
            .map(|s| s.reassembly.n_bytes())
            .chain(self.detached.values().flatten().map(ReassemblyQueue::n_bytes))
            .sum();
        self.config
            .max_receive_buffer_size
            .saturating_sub(u32::try_from(held).unwrap_or(u32::MAX))
    }

    /// A read freed buffer space; tell the peer if its view of our window
    /// had dropped below one packet.
    pub(super) fn on_read(&mut self) {
        if !self.data_flows() {
            return;
        }
        let mtu = self.config.mtu;
        if self.last_advertised_rwnd < mtu && self.receive_window() >= mtu {
            trace!(name = %self.name, "window update");
            self.sack_needed = true;
        }
    }

    pub(super) fn handle_forward_tsn(&mut self, fwd: &ForwardTsnChunk) {
        if !self.use_forward_tsn {
            let cause = ErrorCause::unrecognized_chunk_type(Chunk::ForwardTsn(fwd.clone()).marshal());
            let packet = self.packet(vec![Chunk::Error(ErrorChunk {
                causes: vec![cause],
            })]);
            self.control_queue.push(packet);
            return;
        }
        if !self.data_flows() {
            return;
        }

        if sna32_lte(fwd.new_cumulative_tsn, self.peer_last_tsn) {
            trace!(name = %self.name, "stale FORWARD-TSN");
            self.schedule_sack(true);
            return;
        }

        debug!(
            name = %self.name,
            new_cumulative_tsn = fwd.new_cumulative_tsn,
            "skipping abandoned TSNs"
        );
        self.received.drop_through(fwd.new_cumulative_tsn);
        self.peer_last_tsn = fwd.new_cumulative_tsn;
        for skipped in &fwd.streams {
            if let Some(stream) = self.streams.get_mut(&skipped.stream_id) {
                stream.reassembly.forward_tsn_for_ordered(skipped.ssn);
            }
        }
        for stream in self.streams.values_mut() {
            stream
                .reassembly
                .forward_tsn_for_unordered(fwd.new_cumulative_tsn);
        }

        self.peer_last_tsn = self.received.advance(self.peer_last_tsn);
        self.perform_pending_reset_requests();
        self.schedule_sack(!self.received.is_empty());
    }

    // =========================================================================
    // Acknowledgements (RFC 4960 6.2.1, 7.2.4)
    // =========================================================================

    pub(super) fn handle_sack(&mut self, sack: &SackChunk) {
        if !self.data_flows() {
            trace!(name = %self.name, state = %self.state, "ignoring SACK");
            return;
        }
        self.counters.sacks_received += 1;

        if sna32_gte(sack.cumulative_tsn_ack, self.my_next_tsn) {
            self.protocol_violation("SACK acknowledges a TSN never sent");
            return;
        }
        for block in &sack.gap_ack_blocks {
            let end = sack.cumulative_tsn_ack.wrapping_add(u32::from(block.end));
            if block.start > block.end || sna32_gte(end, self.my_next_tsn) {
                self.protocol_violation("SACK gap block beyond the highest TSN sent");
                return;
            }
        }
        if sna32_lt(sack.cumulative_tsn_ack, self.cumulative_tsn_ack_point) {
            trace!(name = %self.name, cum = sack.cumulative_tsn_ack, "out-of-order SACK");
            return;
        }

        let now = Instant::now();
        let mut acked_per_stream: HashMap<u16, usize> = HashMap::new();
        let mut total_acked = 0usize;
        let mut restart_t3 = false;

        // Cumulative part: everything up to the ack point leaves the queue.
        let mut tsn = self.cumulative_tsn_ack_point.wrapping_add(1);
        while sna32_lte(tsn, sack.cumulative_tsn_ack) {
            let Some(chunk) = self.inflight.pop(tsn) else {
                self.protocol_violation("SACK acknowledges an unknown TSN");
                return;
            };
            if !chunk.acked {
                // The earliest outstanding chunk was acked (RFC 4960 6.3.2 R3).
                if tsn == self.cumulative_tsn_ack_point.wrapping_add(1) {
                    restart_t3 = true;
                }
                let len = chunk.chunk.user_data.len();
                *acked_per_stream.entry(chunk.chunk.stream_id).or_default() += len;
                total_acked += len;
                self.measure_rtt(tsn, chunk.nsent, chunk.since, now);
            }
            tsn = tsn.wrapping_add(1);
        }

        // Gap blocks.
        let mut htna = sack.cumulative_tsn_ack;
        for block in &sack.gap_ack_blocks {
            for offset in block.start..=block.end {
                let tsn = sack.cumulative_tsn_ack.wrapping_add(u32::from(offset));
                let Some(chunk) = self.inflight.get(tsn) else {
                    continue;
                };
                if chunk.acked {
                    continue;
                }
                let (stream_id, nsent, since) = (chunk.chunk.stream_id, chunk.nsent, chunk.since);
                let len = self.inflight.mark_as_acked(tsn);
                *acked_per_stream.entry(stream_id).or_default() += len;
                total_acked += len;
                self.measure_rtt(tsn, nsent, since, now);
                if sna32_lt(htna, tsn) {
                    htna = tsn;
                }
            }
        }

        for (stream_id, n) in acked_per_stream {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.buffered_amount = stream.buffered_amount.saturating_sub(n);
            }
        }

        self.congestion.maybe_exit_fast_recovery(sack.cumulative_tsn_ack);

        let advanced = sna32_lt(self.cumulative_tsn_ack_point, sack.cumulative_tsn_ack);
        if advanced {
            self.cumulative_tsn_ack_point = sack.cumulative_tsn_ack;
            self.congestion
                .on_cumulative_ack(total_acked as u32, !self.pending.has_no_data());
            if self.inflight.is_empty() {
                self.t3_rtx.stop();
            } else if restart_t3 {
                self.t3_rtx.start(self.rto.get_rto());
            }
        }

        self.congestion
            .update_rwnd(sack.a_rwnd, self.inflight.n_bytes());
        self.process_fast_retransmission(sack.cumulative_tsn_ack, htna, advanced);

        if self.use_forward_tsn {
            self.advance_peer_ack_point();
        }
        if !self.inflight.is_empty() && !self.t3_rtx.is_running() {
            self.t3_rtx.start(self.rto.get_rto());
        }
    }

    /// Karn's rule: only chunks sent exactly once, and at most one sample
    /// per round trip.
    fn measure_rtt(&mut self, tsn: u32, nsent: u32, since: Instant, now: Instant) {
        if nsent != 1 || sna32_lt(tsn, self.min_tsn_to_measure_rtt) {
            return;
        }
        self.min_tsn_to_measure_rtt = self.my_next_tsn;
        let rtt = now.duration_since(since).as_secs_f64() * 1000.0;
        let srtt = self.rto.set_new_rtt(rtt);
        trace!(name = %self.name, rtt, srtt, rto = self.rto.get_rto(), "rtt sample");
    }

    /// Count miss indications and enter fast recovery (RFC 4960 7.2.4).
    fn process_fast_retransmission(&mut self, cumulative_tsn_ack: u32, htna: u32, advanced: bool) {
        let in_recovery = self.congestion.in_fast_recovery();
        if !in_recovery || advanced {
            let max_tsn = if in_recovery {
                cumulative_tsn_ack
                    .wrapping_add(self.inflight.len() as u32)
                    .wrapping_add(1)
            } else {
                htna
            };

            let mut tsn = cumulative_tsn_ack.wrapping_add(1);
            while sna32_lt(tsn, max_tsn) {
                if let Some(chunk) = self.inflight.get_mut(tsn) {
                    if !chunk.acked && !chunk.abandoned && chunk.miss_indicator < FAST_RTX_THRESHOLD
                    {
                        chunk.miss_indicator += 1;
                        if chunk.miss_indicator == FAST_RTX_THRESHOLD
                            && self.congestion.enter_fast_recovery(htna)
                        {
                            debug!(
                                name = %self.name,
                                cwnd = self.congestion.cwnd(),
                                "entering fast recovery"
                            );
                            self.will_retransmit_fast = true;
                        }
                    }
                }
                tsn = tsn.wrapping_add(1);
            }
        }

        if in_recovery && advanced {
            self.will_retransmit_fast = true;
        }
    }

    /// T3-rtx expired: collapse cwnd and resend everything outstanding.
    pub(super) fn on_t3_timeout(&mut self) {
        self.counters.t3_timeouts += 1;
        self.congestion.on_retransmission_timeout();
        self.inflight.mark_all_to_retransmit();
        self.advance_peer_ack_point();
    }

    /// Move the advanced peer ack point over abandoned chunks (RFC 3758
    /// 3.5 C1-C3).
    pub(super) fn advance_peer_ack_point(&mut self) {
        if !self.use_forward_tsn {
            return;
        }
        if sna32_lt(self.advanced_peer_tsn_ack_point, self.cumulative_tsn_ack_point) {
            self.advanced_peer_tsn_ack_point = self.cumulative_tsn_ack_point;
        }

        let mut tsn = self.advanced_peer_tsn_ack_point.wrapping_add(1);
        while let Some(chunk) = self.inflight.get(tsn) {
            if !chunk.abandoned {
                break;
            }
            self.advanced_peer_tsn_ack_point = tsn;
            tsn = tsn.wrapping_add(1);
        }

        if sna32_gt(self.advanced_peer_tsn_ack_point, self.cumulative_tsn_ack_point) {
            self.will_send_forward_tsn = true;
        }
    }

    /// Whether the stream's reliability policy gives up on the chunk now.
    fn abandons(&self, chunk: &InflightChunk, now: Instant) -> bool {
        self.use_forward_tsn
            && self
                .streams
                .get(&chunk.chunk.stream_id)
                .is_some_and(|s| s.abandons(chunk, now))
    }

    // =========================================================================
    // Sending
    // =========================================================================

    fn next_tsn(&mut self) -> u32 {
        let tsn = self.my_next_tsn;
        self.my_next_tsn = self.my_next_tsn.wrapping_add(1);
        tsn
    }

    /// Pack DATA chunks into as few MTU-sized packets as possible.
    pub(super) fn bundle_data_chunks(&mut self, chunks: Vec<DataChunk>) -> Vec<Packet> {
        self.counters.datas_sent += chunks.len() as u64;

        let mtu = self.config.mtu as usize;
        let mut packets = Vec::new();
        let mut current: Vec<Chunk> = Vec::new();
        let mut size = COMMON_HEADER_SIZE;
        for chunk in chunks {
            let chunk_size = padded(DATA_CHUNK_HEADER_SIZE + chunk.user_data.len());
            if !current.is_empty() && size + chunk_size > mtu {
                packets.push(self.packet(std::mem::take(&mut current)));
                size = COMMON_HEADER_SIZE;
            }
            size += chunk_size;
            current.push(Chunk::Data(chunk));
        }
        if !current.is_empty() {
            packets.push(self.packet(current));
        }
        packets
    }

    /// Chunks marked by T3-rtx, within the smaller of cwnd and rwnd.
    pub(super) fn gather_retransmissions(&mut self, packets: &mut Vec<Packet>) {
        let window = self.congestion.cwnd().min(self.congestion.rwnd()) as usize;
        let now = Instant::now();
        let marked: Vec<u32> = self
            .inflight
            .iter()
            .filter(|c| c.retransmit && !c.acked && !c.abandoned)
            .map(InflightChunk::tsn)
            .collect();

        let mut chunks = Vec::new();
        let mut bytes = 0usize;
        let mut abandoned_any = false;
        for tsn in marked {
            let Some(chunk) = self.inflight.get(tsn) else {
                continue;
            };
            let len = chunk.chunk.user_data.len();
            if chunk.abandoned {
                continue;
            }
            if self.abandons(chunk, now) {
                abandoned_any |= self.inflight.abandon_message(tsn);
                continue;
            }
            // The first outstanding chunk always goes: it probes a zero window.
            let probe = tsn == self.cumulative_tsn_ack_point.wrapping_add(1);
            if !probe && bytes + len > window {
                break;
            }
            let Some(chunk) = self.inflight.get_mut(tsn) else {
                continue;
            };
            chunk.retransmit = false;
            chunk.nsent += 1;
            bytes += len;
            chunks.push(chunk.chunk.clone());
        }

        if abandoned_any {
            self.advance_peer_ack_point();
        }
        if !chunks.is_empty() {
            debug!(name = %self.name, count = chunks.len(), "retransmitting");
            packets.extend(self.bundle_data_chunks(chunks));
        }
    }

    /// New DATA from the pending queue, plus reset requests for closed
    /// streams whose data has all been given a TSN.
    pub(super) fn gather_data_and_reconfig(&mut self, packets: &mut Vec<Packet>) {
        let now = Instant::now();
        let mut chunks = Vec::new();

        while let Some(head) = self.pending.peek() {
            let len = head.user_data.len();
            if !self.congestion.can_send(self.inflight.n_bytes(), len) {
                break;
            }
            let Some(mut chunk) = self.pending.pop() else {
                break;
            };
            chunk.tsn = self.next_tsn();
            self.congestion.on_sent(len);
            self.counters.bytes_sent += len as u64;
            self.inflight.push(InflightChunk::new(chunk.clone(), now));
            chunks.push(chunk);
        }

        if !chunks.is_empty() {
            trace!(name = %self.name, count = chunks.len(), "sending DATA");
            packets.extend(self.bundle_data_chunks(chunks));
            if !self.t3_rtx.is_running() {
                self.t3_rtx.start(self.rto.get_rto());
            }
        }
        let mut streams_to_reset = Vec::new();
        while let Some(stream_id) = self.pending.pop_ready_reset() {
            streams_to_reset.push(stream_id);
        }
        self.gather_reconfig(streams_to_reset, packets);
    }

    /// Chunks that reached the fast-retransmit threshold, one packet's
    /// worth.
    pub(super) fn gather_fast_retransmissions(&mut self, packets: &mut Vec<Packet>) {
        if !self.will_retransmit_fast {
            return;
        }
        self.will_retransmit_fast = false;

        let mtu = self.config.mtu as usize;
        let now = Instant::now();
        let candidates: Vec<u32> = self
            .inflight
            .iter()
            .filter(|c| {
                !c.acked && !c.abandoned && c.nsent <= 1 && c.miss_indicator >= FAST_RTX_THRESHOLD
            })
            .map(InflightChunk::tsn)
            .collect();

        let mut chunks = Vec::new();
        let mut abandoned_any = false;
        let mut size = COMMON_HEADER_SIZE;
        for tsn in candidates {
            let Some(chunk) = self.inflight.get(tsn) else {
                continue;
            };
            let chunk_size = padded(DATA_CHUNK_HEADER_SIZE + chunk.chunk.user_data.len());
            if chunk.abandoned {
                continue;
            }
            if self.abandons(chunk, now) {
                abandoned_any |= self.inflight.abandon_message(tsn);
                continue;
            }
            if size + chunk_size > mtu {
                break;
            }
            let Some(chunk) = self.inflight.get_mut(tsn) else {
                continue;
            };
            size += chunk_size;
            chunk.nsent += 1;
            chunks.push(chunk.chunk.clone());
            self.counters.fast_retransmits += 1;
        }

        if abandoned_any {
            self.advance_peer_ack_point();
        }
        if !chunks.is_empty() {
            debug!(name = %self.name, count = chunks.len(), "fast retransmit");
            packets.extend(self.bundle_data_chunks(chunks));
        }
    }

    fn create_sack(&mut self) -> SackChunk {
        let a_rwnd = self.receive_window();
        self.last_advertised_rwnd = a_rwnd;
        SackChunk {
            cumulative_tsn_ack: self.peer_last_tsn,
            a_rwnd,
            gap_ack_blocks: self.received.gap_ack_blocks(self.peer_last_tsn),
            duplicate_tsns: self.received.pop_duplicates(),
        }
    }

    pub(super) fn gather_sack(&mut self, packets: &mut Vec<Packet>) {
        if !self.sack_needed {
            return;
        }
        self.sack_needed = false;
        self.ack_timer.stop();
        let sack = self.create_sack();
        trace!(name = %self.name, cum = sack.cumulative_tsn_ack, a_rwnd = sack.a_rwnd, "sending SACK");
        self.counters.sacks_sent += 1;
        packets.push(self.packet(vec![Chunk::Sack(sack)]));
    }

    /// FORWARD-TSN up to the advanced peer ack point, naming the last
    /// abandoned SSN of each ordered stream.
    fn create_forward_tsn(&self) -> ForwardTsnChunk {
        let mut last_ssns: BTreeMap<u16, u16> = BTreeMap::new();
        let mut tsn = self.cumulative_tsn_ack_point.wrapping_add(1);
        while sna32_lte(tsn, self.advanced_peer_tsn_ack_point) {
            if let Some(c) = self.inflight.get(tsn) {
                if !c.chunk.unordered {
                    last_ssns
                        .entry(c.chunk.stream_id)
                        .and_modify(|ssn| {
                            if sna16_lt(*ssn, c.chunk.ssn) {
                                *ssn = c.chunk.ssn;
                            }
                        })
                        .or_insert(c.chunk.ssn);
                }
            }
            tsn = tsn.wrapping_add(1);
        }

        ForwardTsnChunk {
            new_cumulative_tsn: self.advanced_peer_tsn_ack_point,
            streams: last_ssns
                .into_iter()
                .map(|(stream_id, ssn)| ForwardTsnStream { stream_id, ssn })
                .collect(),
        }
    }

    pub(super) fn gather_forward_tsn(&mut self, packets: &mut Vec<Packet>) {
        if !self.will_send_forward_tsn {
            return;
        }
        self.will_send_forward_tsn = false;
        if sna32_gt(self.advanced_peer_tsn_ack_point, self.cumulative_tsn_ack_point) {
            let fwd = self.create_forward_tsn();
            debug!(
                name = %self.name,
                new_cumulative_tsn = fwd.new_cumulative_tsn,
                "sending FORWARD-TSN"
            );
            packets.push(self.packet(vec![Chunk::ForwardTsn(fwd)]));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::association::Config;
    use crate::chunk::GapAckBlock;
    use crate::stream::ReliabilityType;
    use crate::timer::TimerEvent;

    fn pair_with(config: Config) -> (AssociationInternal, AssociationInternal) {
        let (tx, _) = mpsc::unbounded_channel::<TimerEvent>();
        let mut client = AssociationInternal::new(config.clone(), tx.clone());
        let mut server = AssociationInternal::new(config, tx);
        client.start_client();
        for _ in 0..2 {
            exchange(&mut client, &mut server);
            exchange(&mut server, &mut client);
        }
        assert_eq!(client.state(), AssociationState::Established);
        assert_eq!(server.state(), AssociationState::Established);
        (client, server)
    }

    fn pair() -> (AssociationInternal, AssociationInternal) {
        pair_with(Config::default())
    }

    /// Deliver everything `from` wants to send to `to`.
    fn exchange(from: &mut AssociationInternal, to: &mut AssociationInternal) -> usize {
        let packets = from.gather_outbound();
        let n = packets.len();
        for packet in packets {
            to.handle_inbound(&packet.marshal());
        }
        n
    }

    fn read_all(assoc: &mut AssociationInternal, stream_id: u16) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(Ok((data, _))) = assoc.try_read(stream_id, 1 << 20) {
            if data.is_empty() {
                break;
            }
            out.push(data);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_delivery_and_sack() {
        let (mut client, mut server) = pair();
        client
            .open_stream(777, PayloadProtocolIdentifier::STRING)
            .unwrap();
        client
            .try_write(777, &Bytes::from_static(b"HELLO"), None)
            .unwrap()
            .unwrap();
        exchange(&mut client, &mut server);

        assert_eq!(server.try_accept(), Some(Ok(777)));
        let (data, ppi) = server.try_read(777, 64).unwrap().unwrap();
        assert_eq!(&data[..], b"HELLO");
        assert_eq!(ppi, PayloadProtocolIdentifier::STRING);

        // No loss: the SACK waits for the delayed-ack timer.
        assert_eq!(exchange(&mut server, &mut client), 0);
        server.sack_needed = true;
        exchange(&mut server, &mut client);
        assert!(client.inflight.is_empty());
        assert!(!client.t3_rtx.is_running());
        assert_eq!(client.buffered_amount(777), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_message_is_fragmented() {
        let (mut client, mut server) = pair();
        client.open_stream(1, PayloadProtocolIdentifier::BINARY).unwrap();
        let msg = Bytes::from((0..3000u32).map(|i| i as u8).collect::<Vec<_>>());
        client.try_write(1, &msg, None).unwrap().unwrap();

        let packets = client.gather_outbound();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.marshal_size() <= 1228));
        for packet in packets {
            server.handle_inbound(&packet.marshal());
        }
        server.try_accept();
        assert_eq!(
            server.try_read(1, 100),
            Some(Err(AssociationError::ShortBuffer {
                needed: 3000,
                available: 100
            }))
        );
        assert_eq!(read_all(&mut server, 1), vec![msg]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_triggers_immediate_sack_with_gap() {
        let (mut client, mut server) = pair();
        client.open_stream(1, PayloadProtocolIdentifier::BINARY).unwrap();
        for _ in 0..3 {
            client
                .try_write(1, &Bytes::from(vec![0u8; 1200]), None)
                .unwrap()
                .unwrap();
        }
        let packets = client.gather_outbound();
        assert_eq!(packets.len(), 3);
        // Drop the first DATA.
        for packet in &packets[1..] {
            server.handle_inbound(&packet.marshal());
        }

        let sacks = server.gather_outbound();
        let Chunk::Sack(sack) = &sacks[0].chunks[0] else {
            panic!("expected SACK");
        };
        assert_eq!(sack.cumulative_tsn_ack, server.peer_last_tsn);
        assert_eq!(sack.gap_ack_blocks, vec![GapAckBlock { start: 2, end: 3 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_data_is_reported() {
        let (mut client, mut server) = pair();
        client.open_stream(1, PayloadProtocolIdentifier::BINARY).unwrap();
        client
            .try_write(1, &Bytes::from_static(b"once"), None)
            .unwrap()
            .unwrap();
        let packets = client.gather_outbound();
        server.handle_inbound(&packets[0].marshal());
        server.handle_inbound(&packets[0].marshal());

        let sacks = server.gather_outbound();
        let Chunk::Sack(sack) = &sacks[0].chunks[0] else {
            panic!("expected SACK");
        };
        assert_eq!(sack.duplicate_tsns, vec![server.peer_last_tsn]);
        server.try_accept();
        assert_eq!(read_all(&mut server, 1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sack_beyond_sent_tsn_aborts() {
        let (mut client, server) = pair();
        let sack = server.packet(vec![Chunk::Sack(SackChunk {
            cumulative_tsn_ack: client.my_next_tsn.wrapping_add(5),
            a_rwnd: 65535,
            ..Default::default()
        })]);
        client.handle_inbound(&sack.marshal());
        assert!(matches!(
            client.terminated(),
            Some(AssociationError::ProtocolViolation(_))
        ));
        let packets = client.gather_outbound();
        assert!(matches!(packets[0].chunks[0], Chunk::Abort(_)));
    }

    fn data_at(client: &AssociationInternal, tsn: u32) -> Packet {
        client.packet(vec![Chunk::Data(DataChunk {
            tsn,
            stream_id: 1,
            beginning_fragment: true,
            ending_fragment: true,
            user_data: Bytes::from_static(b"far"),
            ..Default::default()
        })])
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_beyond_receive_window_aborts() {
        let (client, mut server) = pair();
        let window = u32::from(u16::MAX);

        // The far edge of the window is still fine.
        let edge = server.peer_last_tsn.wrapping_add(window);
        server.handle_inbound(&data_at(&client, edge).marshal());
        assert!(server.terminated().is_none());
        assert_eq!(server.receive_window(), server.config.max_receive_buffer_size - 3);

        let far = server.peer_last_tsn.wrapping_add(100_000);
        server.handle_inbound(&data_at(&client, far).marshal());
        assert!(matches!(
            server.terminated(),
            Some(AssociationError::ProtocolViolation(_))
        ));
        let packets = server.gather_outbound();
        match &packets[0].chunks[0] {
            Chunk::Abort(abort) => assert_eq!(
                abort.causes[0].code,
                crate::error_cause::ErrorCauseCode::ProtocolViolation
            ),
            other => panic!("expected ABORT, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_buffer_narrows_tsn_window() {
        let (client, mut server) = pair_with(Config {
            max_receive_buffer_size: 1500,
            ..Config::default()
        });
        let far = server.peer_last_tsn.wrapping_add(1501);
        server.handle_inbound(&data_at(&client, far).marshal());
        assert!(matches!(
            server.terminated(),
            Some(AssociationError::ProtocolViolation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_data_aborts() {
        let (client, mut server) = pair();
        let data = client.packet(vec![Chunk::Data(DataChunk {
            tsn: client.my_next_tsn,
            beginning_fragment: true,
            ending_fragment: true,
            ..Default::default()
        })]);
        server.handle_inbound(&data.marshal());
        let packets = server.gather_outbound();
        match &packets[0].chunks[0] {
            Chunk::Abort(abort) => assert_eq!(
                abort.causes[0].code,
                crate::error_cause::ErrorCauseCode::NoUserData
            ),
            other => panic!("expected ABORT, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_t3_timeout_retransmits_and_collapses_cwnd() {
        let (mut client, mut server) = pair();
        client.open_stream(1, PayloadProtocolIdentifier::BINARY).unwrap();
        client
            .try_write(1, &Bytes::from_static(b"lost"), None)
            .unwrap()
            .unwrap();
        let first = client.gather_outbound();
        assert!(client.t3_rtx.is_running());

        client.on_t3_timeout();
        assert_eq!(client.congestion.cwnd(), client.config.mtu);
        let again = client.gather_outbound();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].chunks, first[0].chunks);
        let first_tsn = client.cumulative_tsn_ack_point.wrapping_add(1);
        assert_eq!(client.inflight.get(first_tsn).unwrap().nsent, 2);

        server.handle_inbound(&again[0].marshal());
        server.try_accept();
        assert_eq!(read_all(&mut server, 1), vec![Bytes::from_static(b"lost")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_retransmit_after_three_misses() {
        let (mut client, mut server) = pair();
        client.open_stream(1, PayloadProtocolIdentifier::BINARY).unwrap();
        for _ in 0..4 {
            client
                .try_write(1, &Bytes::from(vec![9u8; 1000]), None)
                .unwrap()
                .unwrap();
        }
        let packets = client.gather_outbound();
        assert_eq!(packets.len(), 4);
        let lost_tsn = client.cumulative_tsn_ack_point.wrapping_add(1);

        // Each later packet produces a SACK with a gap; three of them.
        for packet in &packets[1..] {
            server.handle_inbound(&packet.marshal());
            exchange(&mut server, &mut client);
        }
        assert!(client.congestion.in_fast_recovery());

        let rtx = client.gather_outbound();
        let resent: Vec<u32> = rtx
            .iter()
            .flat_map(|p| p.chunks.iter())
            .filter_map(|c| match c {
                Chunk::Data(d) => Some(d.tsn),
                _ => None,
            })
            .collect();
        assert_eq!(resent, vec![lost_tsn]);
        assert_eq!(client.counters.fast_retransmits, 1);

        for packet in rtx {
            server.handle_inbound(&packet.marshal());
        }
        exchange(&mut server, &mut client);
        assert!(client.inflight.is_empty());
        assert!(!client.congestion.in_fast_recovery());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rexmit_abandonment_sends_forward_tsn() {
        let (mut client, mut server) = pair();
        client.open_stream(2, PayloadProtocolIdentifier::BINARY).unwrap();
        client
            .set_reliability(2, false, ReliabilityType::Rexmit, 0)
            .unwrap();
        client
            .try_write(2, &Bytes::from_static(b"gone"), None)
            .unwrap()
            .unwrap();
        client
            .try_write(2, &Bytes::from_static(b"kept"), None)
            .unwrap()
            .unwrap();
        let packets = client.gather_outbound();
        assert_eq!(packets.len(), 1);
        let gone_tsn = client.cumulative_tsn_ack_point.wrapping_add(1);

        // Only the second message arrives and is gap-acked.
        let Chunk::Data(kept) = packets[0].chunks[1].clone() else {
            panic!("expected DATA");
        };
        server.handle_inbound(&client.packet(vec![Chunk::Data(kept)]).marshal());
        exchange(&mut server, &mut client);
        assert!(client.inflight.get(gone_tsn.wrapping_add(1)).unwrap().acked);

        // T3 fires; the first message may not be sent again and is
        // abandoned instead.
        client.on_t3_timeout();
        let out = client.gather_outbound();
        assert!(out
            .iter()
            .flat_map(|p| p.chunks.iter())
            .all(|c| !matches!(c, Chunk::Data(_))));
        let fwd = out
            .iter()
            .flat_map(|p| p.chunks.iter())
            .find_map(|c| match c {
                Chunk::ForwardTsn(f) => Some(f.clone()),
                _ => None,
            })
            .expect("FORWARD-TSN");
        assert_eq!(fwd.new_cumulative_tsn, gone_tsn);
        assert_eq!(fwd.streams, vec![ForwardTsnStream { stream_id: 2, ssn: 0 }]);

        for packet in out {
            server.handle_inbound(&packet.marshal());
        }
        assert_eq!(server.peer_last_tsn, gone_tsn.wrapping_add(1));
        assert_eq!(server.try_accept(), Some(Ok(2)));
        assert_eq!(read_all(&mut server, 2), vec![Bytes::from_static(b"kept")]);

        // The peer's SACK clears the abandoned chunk too.
        server.sack_needed = true;
        exchange(&mut server, &mut client);
        assert!(client.inflight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_abandonment() {
        let (mut client, mut server) = pair();
        client.open_stream(4, PayloadProtocolIdentifier::BINARY).unwrap();
        client
            .set_reliability(4, true, ReliabilityType::Timed, 100)
            .unwrap();
        client
            .try_write(4, &Bytes::from_static(b"stale"), None)
            .unwrap()
            .unwrap();
        client.gather_outbound();

        tokio::time::advance(Duration::from_millis(150)).await;
        client.on_t3_timeout();
        let out = client.gather_outbound();
        assert!(out
            .iter()
            .flat_map(|p| p.chunks.iter())
            .all(|c| !matches!(c, Chunk::Data(_))));
        let fwd = out
            .iter()
            .flat_map(|p| p.chunks.iter())
            .find_map(|c| match c {
                Chunk::ForwardTsn(f) => Some(f.clone()),
                _ => None,
            })
            .expect("FORWARD-TSN");
        // Unordered messages are not listed per stream.
        assert!(fwd.streams.is_empty());

        for packet in out {
            server.handle_inbound(&packet.marshal());
        }
        assert_eq!(server.peer_last_tsn, fwd.new_cumulative_tsn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_window_shrinks_and_updates() {
        let config = Config {
            max_receive_buffer_size: 4000,
            ..Config::default()
        };
        let (mut client, mut server) = pair_with(config);
        client.open_stream(1, PayloadProtocolIdentifier::BINARY).unwrap();
        for _ in 0..3 {
            client
                .try_write(1, &Bytes::from(vec![1u8; 1200]), None)
                .unwrap()
                .unwrap();
        }
        exchange(&mut client, &mut server);
        assert_eq!(server.receive_window(), 400);

        server.sack_needed = true;
        exchange(&mut server, &mut client);
        assert_eq!(server.last_advertised_rwnd, 400);

        server.try_accept();
        assert_eq!(read_all(&mut server, 1).len(), 3);
        // The read reopened the window; a window update goes out.
        assert!(server.sack_needed);
        let packets = server.gather_outbound();
        let Chunk::Sack(sack) = &packets[0].chunks[0] else {
            panic!("expected SACK");
        };
        assert_eq!(sack.a_rwnd, 4000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_receive_window_drops_new_data() {
        let config = Config {
            max_receive_buffer_size: 1500,
            ..Config::default()
        };
        let (client, mut server) = pair_with(config);
        server.open_stream(1, PayloadProtocolIdentifier::BINARY).unwrap();

        let base = client.my_next_tsn;
        let deliver = |server: &mut AssociationInternal, offset: u32| {
            let data = client.packet(vec![Chunk::Data(DataChunk {
                tsn: base.wrapping_add(offset),
                stream_id: 1,
                ssn: offset as u16,
                beginning_fragment: true,
                ending_fragment: true,
                user_data: Bytes::from(vec![0u8; 1200]),
                ..Default::default()
            })]);
            server.handle_inbound(&data.marshal());
        };

        deliver(&mut server, 0);
        assert_eq!(server.receive_window(), 300);
        // Some credit left: accepted even though it leaves a gap.
        deliver(&mut server, 2);
        assert_eq!(server.receive_window(), 0);
        // No credit and nothing to fill: dropped.
        deliver(&mut server, 3);
        assert!(!server.received.contains(base.wrapping_add(3)));
        // No credit, but it closes the gap: accepted.
        deliver(&mut server, 1);
        assert_eq!(server.peer_last_tsn, base.wrapping_add(2));
        assert!(server.received.is_empty());
    }
}
