//! Stream reset over RE-CONFIG (RFC 6525 5.1, 5.2).
//!
//! Closing a stream queues a reset behind its data. Once none of the
//! stream's data is left in the pending queue an outgoing SSN reset request
//! goes out,
//! retransmitted by the Reconfig timer until the peer answers. A peer
//! request is performed once every TSN up to its sender-last-TSN has
//! arrived; the reset is mirrored so both directions close together.

use tracing::{debug, trace, warn};

use super::internal::AssociationInternal;
use crate::chunk::{Chunk, ReconfigChunk};
use crate::core::{sna32_lte, MAX_RECONFIG_REQUESTS};
use crate::packet::Packet;
use crate::param::{OutgoingResetRequest, Param, ReconfigResponse, ReconfigResult};
use crate::stream::StreamStatus;

impl AssociationInternal {
    pub(super) fn handle_reconfig(&mut self, chunk: ReconfigChunk) {
        if !self.data_flows() {
            trace!(name = %self.name, state = %self.state, "ignoring RECONFIG");
            return;
        }
        for param in std::iter::once(chunk.param_a).chain(chunk.param_b) {
            match param {
                Param::OutgoingResetRequest(request) => {
                    let result = self.handle_reset_request(request.clone());
                    self.send_reconfig_response(request.request_sn, result);
                }
                Param::ReconfigResponse(response) => self.handle_reconfig_response(response),
                other => trace!(name = %self.name, param = ?other, "ignoring RECONFIG parameter"),
            }
        }
    }

    fn handle_reset_request(&mut self, request: OutgoingResetRequest) -> ReconfigResult {
        let rsn = request.request_sn;
        if sna32_lte(rsn, self.peer_last_completed_rsn) {
            // Retransmission of a request already performed.
            return ReconfigResult::SuccessPerformed;
        }
        if self.reconfig_requests.contains_key(&rsn) {
            return ReconfigResult::InProgress;
        }
        if self.reconfig_requests.len() >= MAX_RECONFIG_REQUESTS {
            warn!(name = %self.name, rsn, "too many pending reset requests");
            return ReconfigResult::Denied;
        }

        if sna32_lte(request.sender_last_tsn, self.peer_last_tsn) {
            self.perform_reset(&request);
            ReconfigResult::SuccessPerformed
        } else {
            debug!(
                name = %self.name,
                rsn,
                sender_last_tsn = request.sender_last_tsn,
                "reset request waits for outstanding DATA"
            );
            self.reconfig_requests.insert(rsn, request);
            ReconfigResult::InProgress
        }
    }

    fn perform_reset(&mut self, request: &OutgoingResetRequest) {
        debug!(name = %self.name, rsn = request.request_sn, streams = ?request.stream_ids, "peer reset streams");
        self.peer_last_completed_rsn = request.request_sn;
        self.reset_streams(&request.stream_ids);
    }

    /// Tear down the inbound side of the streams. Unread messages stay
    /// readable until the reader sees end of stream. A stream we had not
    /// closed ourselves is closed in the other direction as well.
    fn reset_streams(&mut self, stream_ids: &[u16]) {
        let ids: Vec<u16> = if stream_ids.is_empty() {
            self.streams.keys().copied().collect()
        } else {
            stream_ids.to_vec()
        };

        for stream_id in ids {
            let Some(stream) = self.streams.remove(&stream_id) else {
                continue;
            };
            if stream.status == StreamStatus::Open {
                self.pending.push_reset(stream_id);
            }
            self.detached
                .entry(stream_id)
                .or_default()
                .push_back(stream.reassembly);
        }
    }

    /// Perform peer requests whose data has now all arrived.
    pub(super) fn perform_pending_reset_requests(&mut self) {
        let ready: Vec<u32> = self
            .reconfig_requests
            .iter()
            .filter(|(_, r)| sna32_lte(r.sender_last_tsn, self.peer_last_tsn))
            .map(|(&rsn, _)| rsn)
            .collect();
        for rsn in ready {
            if let Some(request) = self.reconfig_requests.remove(&rsn) {
                self.perform_reset(&request);
                self.send_reconfig_response(rsn, ReconfigResult::SuccessPerformed);
            }
        }
    }

    fn send_reconfig_response(&mut self, response_sn: u32, result: ReconfigResult) {
        trace!(name = %self.name, response_sn, %result, "sending reconfig response");
        let packet = self.packet(vec![Chunk::Reconfig(ReconfigChunk {
            param_a: Param::ReconfigResponse(ReconfigResponse {
                response_sn,
                result,
            }),
            param_b: None,
        })]);
        self.control_queue.push(packet);
    }

    fn handle_reconfig_response(&mut self, response: ReconfigResponse) {
        let rsn = response.response_sn;
        match response.result {
            ReconfigResult::InProgress => {
                // Asked again when the Reconfig timer fires.
                if self.reconfigs.contains_key(&rsn) && !self.reconfig_timer.is_running() {
                    self.reconfig_timer.start(self.rto.get_rto());
                }
            }
            result => {
                if let Some(request) = self.reconfigs.remove(&rsn) {
                    match result {
                        ReconfigResult::SuccessNop | ReconfigResult::SuccessPerformed => {
                            debug!(name = %self.name, rsn, streams = ?request.stream_ids, "reset acknowledged");
                        }
                        _ => {
                            warn!(name = %self.name, rsn, %result, "peer refused stream reset");
                        }
                    }
                }
            }
        }
        if self.reconfigs.is_empty() {
            self.reconfig_timer.stop();
        }
    }

    /// Emit outstanding reset requests: retransmissions first, then a new
    /// request for `streams_to_reset`.
    pub(super) fn gather_reconfig(&mut self, streams_to_reset: Vec<u16>, packets: &mut Vec<Packet>) {
        if self.will_retransmit_reconfig {
            self.will_retransmit_reconfig = false;
            let resend: Vec<OutgoingResetRequest> = self.reconfigs.values().cloned().collect();
            for request in resend {
                debug!(name = %self.name, rsn = request.request_sn, "retransmitting reset request");
                packets.push(self.reconfig_packet(request));
            }
        }

        if !streams_to_reset.is_empty() {
            let request = OutgoingResetRequest {
                request_sn: self.my_next_rsn,
                response_sn: self.peer_last_completed_rsn,
                sender_last_tsn: self.my_next_tsn.wrapping_sub(1),
                stream_ids: streams_to_reset,
            };
            self.my_next_rsn = self.my_next_rsn.wrapping_add(1);
            debug!(
                name = %self.name,
                rsn = request.request_sn,
                streams = ?request.stream_ids,
                "requesting stream reset"
            );
            self.reconfigs.insert(request.request_sn, request.clone());
            packets.push(self.reconfig_packet(request));
        }

        if !self.reconfigs.is_empty() && !self.reconfig_timer.is_running() {
            self.reconfig_timer.start(self.rto.get_rto());
        }
    }

    fn reconfig_packet(&self, request: OutgoingResetRequest) -> Packet {
        self.packet(vec![Chunk::Reconfig(ReconfigChunk {
            param_a: Param::OutgoingResetRequest(request),
            param_b: None,
        })])
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::association::{AckMode, AssociationError, AssociationState, Config};
    use crate::chunk::PayloadProtocolIdentifier;
    use crate::stream::ReliabilityType;
    use crate::timer::TimerEvent;

    fn pair() -> (AssociationInternal, AssociationInternal) {
        pair_with(Config::default())
    }

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
        (client, server)
    }

    fn exchange(from: &mut AssociationInternal, to: &mut AssociationInternal) -> Vec<Packet> {
        let packets = from.gather_outbound();
        for packet in &packets {
            to.handle_inbound(&packet.marshal());
        }
        packets
    }

    fn reconfig_params(packets: &[Packet]) -> Vec<Param> {
        packets
            .iter()
            .flat_map(|p| p.chunks.iter())
            .filter_map(|c| match c {
                Chunk::Reconfig(r) => Some(r.param_a.clone()),
                _ => None,
            })
            .collect()
    }

    fn request(rsn: u32, sender_last_tsn: u32, streams: &[u16]) -> ReconfigChunk {
        ReconfigChunk {
            param_a: Param::OutgoingResetRequest(OutgoingResetRequest {
                request_sn: rsn,
                response_sn: 0,
                sender_last_tsn,
                stream_ids: streams.to_vec(),
            }),
            param_b: None,
        }
    }

    fn response_result(packets: &[Packet]) -> Option<ReconfigResult> {
        reconfig_params(packets).into_iter().find_map(|p| match p {
            Param::ReconfigResponse(r) => Some(r.result),
            _ => None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_resets_both_directions() {
        let (mut client, mut server) = pair();
        client.open_stream(1, PayloadProtocolIdentifier::BINARY).unwrap();
        client
            .try_write(1, &Bytes::from_static(b"bye"), None)
            .unwrap()
            .unwrap();
        client.close_stream(1);
        assert_eq!(client.stream_status(1), StreamStatus::Closing);
        assert_eq!(
            client.try_write(1, &Bytes::from_static(b"late"), None),
            Some(Err(AssociationError::StreamClosed))
        );

        // DATA and the request travel together.
        let sent = exchange(&mut client, &mut server);
        assert!(matches!(
            reconfig_params(&sent)[0],
            Param::OutgoingResetRequest(_)
        ));
        assert!(client.reconfig_timer.is_running());

        // The id stays taken until the mirrored reset has gone out.
        assert_eq!(
            server.open_stream(1, PayloadProtocolIdentifier::BINARY),
            Err(AssociationError::StreamAlreadyExists(1))
        );

        // Server answers and mirrors the reset.
        let sent = exchange(&mut server, &mut client);
        assert_eq!(response_result(&sent), Some(ReconfigResult::SuccessPerformed));
        assert!(client.reconfigs.is_empty());
        assert_eq!(server.reconfigs.len(), 1);

        // Client performs the mirrored reset; the stream is gone on both sides.
        let sent = exchange(&mut client, &mut server);
        assert_eq!(response_result(&sent), Some(ReconfigResult::SuccessPerformed));
        assert!(server.reconfigs.is_empty());
        assert!(!client.reconfig_timer.is_running());
        assert_eq!(client.stream_status(1), StreamStatus::Closed);
        assert_eq!(server.stream_status(1), StreamStatus::Closed);

        // The message sent before the reset is still readable, then EOF.
        assert_eq!(server.try_accept(), Some(Ok(1)));
        let (data, _) = server.try_read(1, 64).unwrap().unwrap();
        assert_eq!(&data[..], b"bye");
        let (eof, _) = server.try_read(1, 64).unwrap().unwrap();
        assert!(eof.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_request_is_retransmitted() {
        let (mut client, mut server) = pair();
        client.open_stream(3, PayloadProtocolIdentifier::BINARY).unwrap();
        server.open_stream(3, PayloadProtocolIdentifier::BINARY).unwrap();
        client.close_stream(3);
        let lost = client.gather_outbound();
        assert_eq!(reconfig_params(&lost).len(), 1);

        client.will_retransmit_reconfig = true;
        let sent = exchange(&mut client, &mut server);
        assert_eq!(reconfig_params(&sent), reconfig_params(&lost));

        exchange(&mut server, &mut client);
        exchange(&mut client, &mut server);
        assert!(client.reconfigs.is_empty());
        assert!(server.reconfigs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_waits_for_sender_last_tsn() {
        let (client, mut server) = pair();
        server.open_stream(5, PayloadProtocolIdentifier::BINARY).unwrap();
        let last = client.my_next_tsn;

        // The request names a TSN not received yet.
        server.handle_reconfig(request(client.my_next_rsn, last, &[5]));
        let out = server.gather_outbound();
        assert_eq!(response_result(&out), Some(ReconfigResult::InProgress));
        assert_eq!(server.stream_status(5), StreamStatus::Open);

        // The same request again is still in progress.
        server.handle_reconfig(request(client.my_next_rsn, last, &[5]));
        assert_eq!(
            response_result(&server.gather_outbound()),
            Some(ReconfigResult::InProgress)
        );

        // The missing DATA arrives; the reset is performed and answered.
        let data = client.packet(vec![Chunk::Data(crate::chunk::DataChunk {
            tsn: last,
            stream_id: 5,
            beginning_fragment: true,
            ending_fragment: true,
            user_data: Bytes::from_static(b"last"),
            ..Default::default()
        })]);
        server.handle_inbound(&data.marshal());
        assert!(server.reconfig_requests.is_empty());
        assert_eq!(server.stream_status(5), StreamStatus::Closed);
        let out = server.gather_outbound();
        assert_eq!(response_result(&out), Some(ReconfigResult::SuccessPerformed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_request_does_not_reset_again() {
        let (client, mut server) = pair();
        let rsn = client.my_next_rsn;
        server.open_stream(7, PayloadProtocolIdentifier::BINARY).unwrap();
        server.handle_reconfig(request(rsn, server.peer_last_tsn, &[7]));
        assert_eq!(server.stream_status(7), StreamStatus::Closed);
        server.gather_outbound();

        // The stream is opened again; a stale retransmission must not touch it.
        server.open_stream(7, PayloadProtocolIdentifier::BINARY).unwrap();
        server.handle_reconfig(request(rsn, server.peer_last_tsn, &[7]));
        assert_eq!(server.stream_status(7), StreamStatus::Open);
        assert_eq!(
            response_result(&server.gather_outbound()),
            Some(ReconfigResult::SuccessPerformed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_request_is_dropped() {
        let (mut client, _server) = pair();
        client.open_stream(9, PayloadProtocolIdentifier::BINARY).unwrap();
        client.close_stream(9);
        client.gather_outbound();
        let rsn = *client.reconfigs.keys().next().unwrap();

        client.handle_reconfig(ReconfigChunk {
            param_a: Param::ReconfigResponse(ReconfigResponse {
                response_sn: rsn,
                result: ReconfigResult::InProgress,
            }),
            param_b: None,
        });
        assert_eq!(client.reconfigs.len(), 1);

        client.handle_reconfig(ReconfigChunk {
            param_a: Param::ReconfigResponse(ReconfigResponse {
                response_sn: rsn,
                result: ReconfigResult::Denied,
            }),
            param_b: None,
        });
        assert!(client.reconfigs.is_empty());
        assert!(!client.reconfig_timer.is_running());
    }

    fn no_delay() -> Config {
        Config {
            ack_mode: AckMode::NoDelay,
            ..Config::default()
        }
    }

    fn settle(client: &mut AssociationInternal, server: &mut AssociationInternal) {
        for _ in 0..10 {
            exchange(client, server);
            exchange(server, client);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_waits_for_data_written_in_other_order_mode() {
        let (mut client, mut server) = pair_with(no_delay());
        client.open_stream(1, PayloadProtocolIdentifier::BINARY).unwrap();
        for i in 0..6u8 {
            let msg = Bytes::from(vec![i; 1200]);
            client.try_write(1, &msg, None).unwrap().unwrap();
        }
        // Unordered from now on; the ordered messages are still queued.
        client
            .set_reliability(1, true, ReliabilityType::Reliable, 0)
            .unwrap();
        client.close_stream(1);

        // cwnd holds back half of the messages, and the reset with them.
        let sent = exchange(&mut client, &mut server);
        assert!(reconfig_params(&sent).is_empty());
        assert!(client.pending.has_reset(1));

        settle(&mut client, &mut server);
        assert!(client.pending.is_empty());
        assert!(client.reconfigs.is_empty());
        assert!(server.reconfigs.is_empty());
        assert_eq!(server.stream_status(1), StreamStatus::Closed);

        assert_eq!(server.try_accept(), Some(Ok(1)));
        for i in 0..6u8 {
            let (data, _) = server.try_read(1, 2000).unwrap().unwrap();
            assert_eq!(data.len(), 1200);
            assert_eq!(data[0], i);
        }
        let (eof, _) = server.try_read(1, 2000).unwrap().unwrap();
        assert!(eof.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopened_stream_keeps_unread_data() {
        let (mut client, mut server) = pair_with(no_delay());
        client.open_stream(9, PayloadProtocolIdentifier::BINARY).unwrap();
        client
            .try_write(9, &Bytes::from_static(b"one"), None)
            .unwrap()
            .unwrap();
        client.close_stream(9);
        settle(&mut client, &mut server);
        assert_eq!(client.stream_status(9), StreamStatus::Closed);

        // Reopened and written before the server read anything.
        client.open_stream(9, PayloadProtocolIdentifier::BINARY).unwrap();
        client
            .try_write(9, &Bytes::from_static(b"two"), None)
            .unwrap()
            .unwrap();
        settle(&mut client, &mut server);
        assert_eq!(server.stream_status(9), StreamStatus::Open);

        // Each incarnation is announced once.
        assert_eq!(server.try_accept(), Some(Ok(9)));
        assert_eq!(server.try_accept(), Some(Ok(9)));
        assert_eq!(server.try_accept(), None);

        let mut delivered = Vec::new();
        for _ in 0..3 {
            let (data, _) = server.try_read(9, 64).unwrap().unwrap();
            delivered.push(data);
        }
        assert_eq!(
            delivered,
            vec![
                Bytes::from_static(b"one"),
                Bytes::new(),
                Bytes::from_static(b"two")
            ]
        );
        assert_eq!(server.try_read(9, 64), None);
        assert!(server.detached.is_empty());
    }
}
