//! Association state machine: handshake, chunk dispatch, shutdown, timers
//! and the stream operations requested by handles.
//!
//! DATA/SACK handling lives in `data.rs` and stream reset in `reconfig.rs`;
//! all three extend [`AssociationInternal`].

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::Bytes;
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::config::Config;
use super::cookie::{now_ms, CookieError, CookieSigner, StateCookie};
use super::error::AssociationError;
use super::stats::{AssociationStats, Counters};
use super::AssociationState;
use crate::chunk::{
    AbortChunk, Chunk, ChunkError, ChunkType, CookieEchoChunk, ErrorChunk, InitChunk,
    PayloadProtocolIdentifier, ShutdownChunk, ShutdownCompleteChunk, UnknownChunk,
    UnrecognizedAction,
};
use crate::congestion::CongestionController;
use crate::core::{
    ASSOCIATION_MAX_RETRANS, COMMON_HEADER_SIZE, DEFAULT_SCTP_PORT, MAX_INIT_RETRANS, MAX_STREAMS,
    MIN_INIT_A_RWND, PATH_MAX_RETRANS,
};
use crate::error_cause::ErrorCause;
use crate::packet::Packet;
use crate::param::{types, OutgoingResetRequest, Param};
use crate::queue::{InflightQueue, PendingQueue, ReceivedQueue};
use crate::reassembly::ReassemblyQueue;
use crate::stream::{ReliabilityType, StreamState, StreamStatus};
use crate::timer::{AckTimer, RtoManager, RtxTimer, RtxTimerId, TimerEvent};

/// Everything the driver task owns about one association.
pub(crate) struct AssociationInternal {
    pub(super) name: String,
    pub(super) config: Config,
    pub(super) state: AssociationState,
    /// Set once the association has ended; the reason is handed to every
    /// operation attempted afterwards.
    terminated: Option<AssociationError>,

    pub(super) my_verification_tag: u32,
    pub(super) peer_verification_tag: u32,
    my_initial_tsn: u32,
    pub(super) my_next_tsn: u32,
    pub(super) peer_last_tsn: u32,
    pub(super) cumulative_tsn_ack_point: u32,
    pub(super) advanced_peer_tsn_ack_point: u32,
    pub(super) min_tsn_to_measure_rtt: u32,
    pub(super) use_forward_tsn: bool,

    pub(super) my_next_rsn: u32,
    pub(super) peer_last_completed_rsn: u32,
    /// Our reset requests awaiting a response, by request sequence number.
    pub(super) reconfigs: BTreeMap<u32, OutgoingResetRequest>,
    /// Peer reset requests waiting for their sender-last-TSN to arrive.
    pub(super) reconfig_requests: BTreeMap<u32, OutgoingResetRequest>,

    pub(super) pending: PendingQueue,
    pub(super) inflight: InflightQueue,
    pub(super) received: ReceivedQueue,
    pub(super) congestion: CongestionController,
    pub(super) rto: RtoManager,

    t1_init: RtxTimer,
    t1_cookie: RtxTimer,
    t2_shutdown: RtxTimer,
    pub(super) t3_rtx: RtxTimer,
    pub(super) reconfig_timer: RtxTimer,
    pub(super) ack_timer: AckTimer,

    cookie_signer: CookieSigner,
    stored_init: Option<InitChunk>,
    stored_cookie_echo: Option<Bytes>,

    pub(super) streams: HashMap<u16, StreamState>,
    /// Streams reset by the peer whose buffered messages are still
    /// readable, oldest incarnation first. Reads drain these before a
    /// reopened stream of the same id.
    pub(super) detached: HashMap<u16, VecDeque<ReassemblyQueue>>,
    pub(super) accept_queue: VecDeque<u16>,

    /// Packets sent as-is on the next flush, ahead of everything else.
    pub(super) control_queue: Vec<Packet>,
    pub(super) sack_needed: bool,
    pub(super) will_retransmit_fast: bool,
    pub(super) will_retransmit_reconfig: bool,
    pub(super) will_send_forward_tsn: bool,
    will_send_shutdown: bool,
    will_send_shutdown_ack: bool,
    pub(super) last_advertised_rwnd: u32,

    pub(super) counters: Counters,
}

impl AssociationInternal {
    pub(crate) fn new(config: Config, timers: mpsc::UnboundedSender<TimerEvent>) -> Self {
        let mut rng = rand::thread_rng();
        let my_verification_tag = loop {
            let tag = rng.next_u32();
            if tag != 0 {
                break tag;
            }
        };
        let my_initial_tsn = rng.next_u32();
        let rto_max = config.rto_max;

        Self {
            name: config.name.clone(),
            state: AssociationState::Closed,
            terminated: None,

            my_verification_tag,
            peer_verification_tag: 0,
            my_initial_tsn,
            my_next_tsn: my_initial_tsn,
            peer_last_tsn: 0,
            cumulative_tsn_ack_point: my_initial_tsn.wrapping_sub(1),
            advanced_peer_tsn_ack_point: my_initial_tsn.wrapping_sub(1),
            min_tsn_to_measure_rtt: my_initial_tsn,
            use_forward_tsn: false,

            my_next_rsn: my_initial_tsn,
            peer_last_completed_rsn: 0,
            reconfigs: BTreeMap::new(),
            reconfig_requests: BTreeMap::new(),

            pending: PendingQueue::new(),
            inflight: InflightQueue::new(),
            received: ReceivedQueue::new(),
            // Replaced once the peer's window is known.
            congestion: CongestionController::new(config.mtu, config.max_receive_buffer_size),
            rto: RtoManager::with_bounds(config.rto_initial, config.rto_min, rto_max),

            t1_init: RtxTimer::new(RtxTimerId::T1Init, MAX_INIT_RETRANS, rto_max, timers.clone()),
            t1_cookie: RtxTimer::new(
                RtxTimerId::T1Cookie,
                MAX_INIT_RETRANS,
                rto_max,
                timers.clone(),
            ),
            t2_shutdown: RtxTimer::new(
                RtxTimerId::T2Shutdown,
                PATH_MAX_RETRANS,
                rto_max,
                timers.clone(),
            ),
            t3_rtx: RtxTimer::new(
                RtxTimerId::T3Rtx,
                ASSOCIATION_MAX_RETRANS,
                rto_max,
                timers.clone(),
            ),
            reconfig_timer: RtxTimer::new(
                RtxTimerId::Reconfig,
                ASSOCIATION_MAX_RETRANS,
                rto_max,
                timers.clone(),
            ),
            ack_timer: AckTimer::new(timers),

            cookie_signer: CookieSigner::new(),
            stored_init: None,
            stored_cookie_echo: None,

            streams: HashMap::new(),
            detached: HashMap::new(),
            accept_queue: VecDeque::new(),

            control_queue: Vec::new(),
            sack_needed: false,
            will_retransmit_fast: false,
            will_retransmit_reconfig: false,
            will_send_forward_tsn: false,
            will_send_shutdown: false,
            will_send_shutdown_ack: false,
            last_advertised_rwnd: config.max_receive_buffer_size,

            counters: Counters::default(),
            config,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub(crate) fn state(&self) -> AssociationState {
        self.state
    }

    pub(super) fn set_state(&mut self, state: AssociationState) {
        if self.state != state {
            debug!(name = %self.name, "state change: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Why the association ended, if it has.
    pub(crate) fn terminated(&self) -> Option<&AssociationError> {
        self.terminated.as_ref()
    }

    /// End the association. Timers stop and outbound data is dropped; queued
    /// control packets (ABORT, SHUTDOWN-COMPLETE) still go out on the next
    /// flush and buffered inbound messages stay readable.
    pub(crate) fn terminate(&mut self, reason: AssociationError) {
        if self.terminated.is_some() {
            return;
        }
        match &reason {
            AssociationError::Closed => debug!(name = %self.name, "association closed"),
            other => warn!(name = %self.name, error = %other, "association terminated"),
        }

        self.set_state(AssociationState::Closed);
        for timer in [
            &self.t1_init,
            &self.t1_cookie,
            &self.t2_shutdown,
            &self.t3_rtx,
            &self.reconfig_timer,
        ] {
            timer.close();
        }
        self.ack_timer.close();

        self.pending = PendingQueue::new();
        self.inflight = InflightQueue::new();
        self.reconfigs.clear();
        self.reconfig_requests.clear();
        self.sack_needed = false;
        self.will_retransmit_fast = false;
        self.will_retransmit_reconfig = false;
        self.will_send_forward_tsn = false;
        self.will_send_shutdown = false;
        self.will_send_shutdown_ack = false;
        self.terminated = Some(reason);
    }

    /// Error for operations that need a live association.
    fn closed_error(&self) -> AssociationError {
        match &self.terminated {
            Some(AssociationError::Closed) | None => AssociationError::StreamClosed,
            Some(reason) => reason.clone(),
        }
    }

    /// Abort locally: ABORT goes to the peer if it can be addressed.
    pub(crate) fn close(&mut self) {
        if self.terminated.is_some() {
            return;
        }
        if self.peer_verification_tag != 0 {
            let abort = AbortChunk::with_cause(ErrorCause::user_initiated_abort("association closed"));
            let packet = self.packet(vec![Chunk::Abort(abort)]);
            self.control_queue.push(packet);
        }
        self.terminate(AssociationError::Closed);
    }

    /// Send ABORT carrying `cause` and end the association with `reason`.
    pub(super) fn abort(&mut self, cause: ErrorCause, reason: AssociationError) {
        // Without a peer tag the ABORT reflects ours back (T bit).
        let (verification_tag, reflected_tag) = if self.peer_verification_tag != 0 {
            (self.peer_verification_tag, false)
        } else {
            (self.my_verification_tag, true)
        };
        self.control_queue.push(Packet {
            source_port: DEFAULT_SCTP_PORT,
            destination_port: DEFAULT_SCTP_PORT,
            verification_tag,
            chunks: vec![Chunk::Abort(AbortChunk {
                reflected_tag,
                causes: vec![cause],
            })],
        });
        self.terminate(reason);
    }

    pub(super) fn protocol_violation(&mut self, info: &str) {
        self.abort(
            ErrorCause::protocol_violation(info),
            AssociationError::ProtocolViolation(info.to_string()),
        );
    }

    /// Wrap chunks in a packet addressed to the peer.
    pub(super) fn packet(&self, chunks: Vec<Chunk>) -> Packet {
        Packet {
            source_port: DEFAULT_SCTP_PORT,
            destination_port: DEFAULT_SCTP_PORT,
            verification_tag: self.peer_verification_tag,
            chunks,
        }
    }

    pub(crate) fn stats(&self) -> AssociationStats {
        AssociationStats {
            state: self.state,
            cwnd: self.congestion.cwnd(),
            ssthresh: self.congestion.ssthresh(),
            rwnd: self.congestion.rwnd(),
            receive_window: self.receive_window(),
            bytes_in_flight: self.inflight.n_bytes(),
            pending_bytes: self.pending.n_bytes(),
            pending_reconfigs: self.reconfigs.len(),
            srtt: self.rto.srtt(),
            rto: self.rto.get_rto(),
            counters: self.counters,
        }
    }

    // =========================================================================
    // Handshake (RFC 4960 5.1)
    // =========================================================================

    /// Send INIT and wait in COOKIE-WAIT.
    pub(crate) fn start_client(&mut self) {
        let init = InitChunk {
            initiate_tag: self.my_verification_tag,
            a_rwnd: self.config.max_receive_buffer_size,
            num_outbound_streams: MAX_STREAMS,
            num_inbound_streams: MAX_STREAMS,
            initial_tsn: self.my_initial_tsn,
            params: supported_extensions(),
        };
        self.stored_init = Some(init);
        self.send_init();
        self.t1_init.start(self.rto.get_rto());
        self.set_state(AssociationState::CookieWait);
    }

    fn send_init(&mut self) {
        let Some(init) = self.stored_init.clone() else {
            return;
        };
        trace!(name = %self.name, "sending INIT");
        // INIT always goes out with a zero verification tag.
        self.control_queue.push(Packet {
            source_port: DEFAULT_SCTP_PORT,
            destination_port: DEFAULT_SCTP_PORT,
            verification_tag: 0,
            chunks: vec![Chunk::Init(init)],
        });
    }

    fn send_cookie_echo(&mut self) {
        let Some(cookie) = self.stored_cookie_echo.clone() else {
            return;
        };
        trace!(name = %self.name, "sending COOKIE-ECHO");
        let packet = self.packet(vec![Chunk::CookieEcho(CookieEchoChunk { cookie })]);
        self.control_queue.push(packet);
    }

    /// Answer an INIT statelessly: everything needed later travels in the
    /// signed cookie.
    fn handle_init(&mut self, init: &InitChunk) {
        if !matches!(
            self.state,
            AssociationState::Closed | AssociationState::CookieWait | AssociationState::CookieEchoed
        ) {
            debug!(name = %self.name, state = %self.state, "ignoring INIT");
            return;
        }
        if let Err(reason) = check_init(init) {
            self.control_queue.push(Packet {
                source_port: DEFAULT_SCTP_PORT,
                destination_port: DEFAULT_SCTP_PORT,
                verification_tag: init.initiate_tag,
                chunks: vec![Chunk::Abort(AbortChunk::with_cause(
                    ErrorCause::invalid_mandatory_parameter(),
                ))],
            });
            self.terminate(AssociationError::ProtocolViolation(reason.to_string()));
            return;
        }

        let cookie = StateCookie {
            peer_tag: init.initiate_tag,
            my_tag: self.my_verification_tag,
            peer_initial_tsn: init.initial_tsn,
            my_initial_tsn: self.my_initial_tsn,
            peer_a_rwnd: init.a_rwnd,
            peer_num_outbound_streams: init.num_outbound_streams,
            peer_num_inbound_streams: init.num_inbound_streams,
            use_forward_tsn: init.supports_forward_tsn(),
            created_ms: now_ms(),
        };

        let mut params = vec![Param::StateCookie(self.cookie_signer.sign(&cookie))];
        params.extend(supported_extensions());
        params.extend(
            init.unrecognized_params_to_report()
                .iter()
                .map(|p| Param::Unrecognized(p.marshal())),
        );

        let init_ack = InitChunk {
            initiate_tag: self.my_verification_tag,
            a_rwnd: self.config.max_receive_buffer_size,
            num_outbound_streams: MAX_STREAMS,
            num_inbound_streams: MAX_STREAMS,
            initial_tsn: self.my_initial_tsn,
            params,
        };
        trace!(name = %self.name, "sending INIT-ACK");
        self.control_queue.push(Packet {
            source_port: DEFAULT_SCTP_PORT,
            destination_port: DEFAULT_SCTP_PORT,
            verification_tag: init.initiate_tag,
            chunks: vec![Chunk::InitAck(init_ack)],
        });
    }

    fn handle_init_ack(&mut self, init_ack: &InitChunk) {
        if self.state != AssociationState::CookieWait {
            debug!(name = %self.name, state = %self.state, "ignoring INIT-ACK");
            return;
        }
        if let Err(reason) = check_init(init_ack) {
            self.abort(
                ErrorCause::invalid_mandatory_parameter(),
                AssociationError::HandshakeFailed(reason.to_string()),
            );
            return;
        }
        let Some(cookie) = init_ack.state_cookie().cloned() else {
            self.abort_missing_cookie(init_ack.initiate_tag);
            return;
        };

        self.peer_verification_tag = init_ack.initiate_tag;
        self.peer_last_tsn = init_ack.initial_tsn.wrapping_sub(1);
        self.peer_last_completed_rsn = init_ack.initial_tsn.wrapping_sub(1);
        self.use_forward_tsn = init_ack.supports_forward_tsn();
        self.congestion = CongestionController::new(self.config.mtu, init_ack.a_rwnd);

        self.t1_init.stop();
        self.stored_init = None;
        self.stored_cookie_echo = Some(cookie);
        self.send_cookie_echo();
        self.t1_cookie.start(self.rto.get_rto());
        self.set_state(AssociationState::CookieEchoed);
    }

    /// INIT-ACK without a state cookie: reflect an ABORT and give up.
    fn abort_missing_cookie(&mut self, verification_tag: u32) {
        self.control_queue.push(Packet {
            source_port: DEFAULT_SCTP_PORT,
            destination_port: DEFAULT_SCTP_PORT,
            verification_tag,
            chunks: vec![Chunk::Abort(AbortChunk {
                reflected_tag: true,
                causes: vec![ErrorCause::missing_mandatory_parameter(
                    types::STATE_COOKIE,
                )],
            })],
        });
        self.terminate(AssociationError::HandshakeFailed(
            "INIT-ACK without state cookie".to_string(),
        ));
    }

    fn handle_cookie_echo(&mut self, echo: &CookieEchoChunk) {
        let cookie = match self.cookie_signer.verify(&echo.cookie) {
            Ok(cookie) => cookie,
            Err(CookieError::Stale {
                staleness_us,
                peer_tag,
            }) => {
                if !self.is_handshaking() {
                    debug!(name = %self.name, staleness_us, "ignoring stale COOKIE-ECHO");
                    return;
                }
                self.control_queue.push(Packet {
                    source_port: DEFAULT_SCTP_PORT,
                    destination_port: DEFAULT_SCTP_PORT,
                    verification_tag: peer_tag,
                    chunks: vec![Chunk::Abort(AbortChunk::with_cause(
                        ErrorCause::stale_cookie(staleness_us),
                    ))],
                });
                self.terminate(AssociationError::ProtocolViolation(format!(
                    "stale state cookie ({staleness_us} us past lifetime)"
                )));
                return;
            }
            Err(e) => {
                debug!(name = %self.name, error = %e, "dropping COOKIE-ECHO");
                return;
            }
        };
        if cookie.my_tag != self.my_verification_tag {
            debug!(name = %self.name, "COOKIE-ECHO for another association");
            return;
        }

        match self.state {
            AssociationState::Closed
            | AssociationState::CookieWait
            | AssociationState::CookieEchoed => {
                self.establish(&cookie);
                self.send_cookie_ack();
            }
            // Our COOKIE-ACK was lost: acknowledge again.
            AssociationState::Established if cookie.peer_tag == self.peer_verification_tag => {
                self.send_cookie_ack();
            }
            state => debug!(name = %self.name, %state, "ignoring COOKIE-ECHO"),
        }
    }

    fn is_handshaking(&self) -> bool {
        matches!(
            self.state,
            AssociationState::Closed | AssociationState::CookieWait | AssociationState::CookieEchoed
        )
    }

    fn establish(&mut self, cookie: &StateCookie) {
        self.peer_verification_tag = cookie.peer_tag;
        self.peer_last_tsn = cookie.peer_initial_tsn.wrapping_sub(1);
        self.peer_last_completed_rsn = cookie.peer_initial_tsn.wrapping_sub(1);
        self.use_forward_tsn = cookie.use_forward_tsn;
        self.congestion = CongestionController::new(self.config.mtu, cookie.peer_a_rwnd);

        self.t1_init.stop();
        self.t1_cookie.stop();
        self.stored_init = None;
        self.stored_cookie_echo = None;
        self.set_state(AssociationState::Established);
    }

    fn send_cookie_ack(&mut self) {
        let packet = self.packet(vec![Chunk::CookieAck]);
        self.control_queue.push(packet);
    }

    fn handle_cookie_ack(&mut self) {
        if self.state != AssociationState::CookieEchoed {
            trace!(name = %self.name, state = %self.state, "ignoring COOKIE-ACK");
            return;
        }
        self.t1_cookie.stop();
        self.stored_cookie_echo = None;
        self.set_state(AssociationState::Established);
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    /// Decode and process one datagram.
    pub(crate) fn handle_inbound(&mut self, raw: &Bytes) {
        let packet = match Packet::unmarshal(raw) {
            Ok(packet) => packet,
            Err(ChunkError::MissingParam(_))
                if self.state == AssociationState::CookieWait
                    && raw.get(COMMON_HEADER_SIZE) == Some(&ChunkType::InitAck.as_byte()) =>
            {
                let tag = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
                self.abort_missing_cookie(tag);
                return;
            }
            Err(e) => {
                debug!(name = %self.name, error = %e, "dropping undecodable packet");
                return;
            }
        };

        if !self.verification_tag_matches(&packet) {
            trace!(
                name = %self.name,
                tag = packet.verification_tag,
                "dropping packet with wrong verification tag"
            );
            return;
        }

        for chunk in packet.chunks {
            if self.terminated.is_some() || !self.handle_chunk(chunk) {
                break;
            }
        }
    }

    /// RFC 4960 8.5 and 8.5.1.
    fn verification_tag_matches(&self, packet: &Packet) -> bool {
        match packet.chunks.first() {
            Some(Chunk::Init(_)) => true,
            Some(Chunk::Abort(AbortChunk {
                reflected_tag: true,
                ..
            }))
            | Some(Chunk::ShutdownComplete(ShutdownCompleteChunk {
                reflected_tag: true,
            })) => packet.verification_tag == self.peer_verification_tag,
            _ => packet.verification_tag == self.my_verification_tag,
        }
    }

    /// Returns `false` when the rest of the packet must be discarded.
    fn handle_chunk(&mut self, chunk: Chunk) -> bool {
        trace!(name = %self.name, chunk = %chunk, "received");
        match chunk {
            Chunk::Init(init) => self.handle_init(&init),
            Chunk::InitAck(init_ack) => self.handle_init_ack(&init_ack),
            Chunk::CookieEcho(echo) => self.handle_cookie_echo(&echo),
            Chunk::CookieAck => self.handle_cookie_ack(),
            Chunk::Data(data) => self.handle_data(data),
            Chunk::Sack(sack) => self.handle_sack(&sack),
            Chunk::Heartbeat(hb) => {
                let packet = self.packet(vec![Chunk::HeartbeatAck(hb)]);
                self.control_queue.push(packet);
            }
            Chunk::HeartbeatAck(_) => {}
            Chunk::Abort(abort) => self.handle_abort(&abort),
            Chunk::Error(error) => {
                for cause in &error.causes {
                    warn!(name = %self.name, cause = %cause, "peer reported error");
                }
            }
            Chunk::Shutdown(shutdown) => self.handle_shutdown(&shutdown),
            Chunk::ShutdownAck => self.handle_shutdown_ack(),
            Chunk::ShutdownComplete(_) => self.handle_shutdown_complete(),
            Chunk::Reconfig(reconfig) => self.handle_reconfig(reconfig),
            Chunk::ForwardTsn(fwd) => self.handle_forward_tsn(&fwd),
            Chunk::Unknown(unknown) => return self.handle_unknown_chunk(unknown),
        }
        true
    }

    /// Apply the action bits of an unrecognized chunk (RFC 4960 3.2).
    fn handle_unknown_chunk(&mut self, chunk: UnknownChunk) -> bool {
        let typ = chunk.typ;
        let action = chunk.action();
        let cause = ErrorCause::unrecognized_chunk_type(Chunk::Unknown(chunk).marshal());
        match action {
            UnrecognizedAction::Stop | UnrecognizedAction::StopAndReport => {
                self.abort(
                    cause,
                    AssociationError::ProtocolViolation(format!("unrecognized chunk type {typ}")),
                );
                false
            }
            UnrecognizedAction::Skip => true,
            UnrecognizedAction::SkipAndReport => {
                let packet = self.packet(vec![Chunk::Error(ErrorChunk {
                    causes: vec![cause],
                })]);
                self.control_queue.push(packet);
                true
            }
        }
    }

    fn handle_abort(&mut self, abort: &AbortChunk) {
        let reason = if abort.causes.is_empty() {
            "no cause given".to_string()
        } else {
            abort
                .causes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        };
        self.terminate(AssociationError::Aborted(reason));
    }

    // =========================================================================
    // Shutdown (RFC 4960 9.2)
    // =========================================================================

    /// Begin a graceful shutdown. The caller waits for termination.
    pub(crate) fn shutdown(&mut self) -> Result<(), AssociationError> {
        match self.state {
            AssociationState::Established => {
                self.set_state(AssociationState::ShutdownPending);
                Ok(())
            }
            state if state.is_shutting_down() => Ok(()),
            state => Err(AssociationError::InvalidState(state)),
        }
    }

    fn handle_shutdown(&mut self, shutdown: &ShutdownChunk) {
        trace!(
            name = %self.name,
            cumulative_tsn_ack = shutdown.cumulative_tsn_ack,
            "SHUTDOWN received"
        );
        match self.state {
            AssociationState::Established | AssociationState::ShutdownPending => {
                self.set_state(AssociationState::ShutdownReceived);
            }
            AssociationState::ShutdownSent => {
                self.t2_shutdown.stop();
                self.will_send_shutdown = false;
                self.will_send_shutdown_ack = true;
                self.set_state(AssociationState::ShutdownAckSent);
            }
            _ => {}
        }
    }

    fn handle_shutdown_ack(&mut self) {
        if !matches!(
            self.state,
            AssociationState::ShutdownSent | AssociationState::ShutdownAckSent
        ) {
            return;
        }
        self.t2_shutdown.stop();
        let packet = self.packet(vec![Chunk::ShutdownComplete(ShutdownCompleteChunk {
            reflected_tag: false,
        })]);
        self.control_queue.push(packet);
        self.terminate(AssociationError::Closed);
    }

    fn handle_shutdown_complete(&mut self) {
        if self.state != AssociationState::ShutdownAckSent {
            return;
        }
        self.t2_shutdown.stop();
        self.terminate(AssociationError::Closed);
    }

    /// Move a draining shutdown forward once nothing is queued or in
    /// flight.
    fn check_shutdown_progress(&mut self) {
        let drained = self.pending.is_empty() && self.inflight.is_empty();
        match self.state {
            AssociationState::ShutdownPending if drained => {
                self.will_send_shutdown = true;
                self.set_state(AssociationState::ShutdownSent);
            }
            AssociationState::ShutdownReceived if drained => {
                self.will_send_shutdown_ack = true;
                self.set_state(AssociationState::ShutdownAckSent);
            }
            _ => {}
        }
    }

    fn gather_shutdown(&mut self, packets: &mut Vec<Packet>) {
        if self.will_send_shutdown {
            self.will_send_shutdown = false;
            packets.push(self.packet(vec![Chunk::Shutdown(ShutdownChunk {
                cumulative_tsn_ack: self.peer_last_tsn,
            })]));
            if !self.t2_shutdown.is_running() {
                self.t2_shutdown.start(self.rto.get_rto());
            }
        } else if self.will_send_shutdown_ack {
            self.will_send_shutdown_ack = false;
            packets.push(self.packet(vec![Chunk::ShutdownAck]));
            if !self.t2_shutdown.is_running() {
                self.t2_shutdown.start(self.rto.get_rto());
            }
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Collect every packet the current state calls for.
    pub(crate) fn gather_outbound(&mut self) -> Vec<Packet> {
        self.check_shutdown_progress();

        let mut packets = std::mem::take(&mut self.control_queue);
        match self.state {
            AssociationState::Established => {
                self.gather_retransmissions(&mut packets);
                self.gather_data_and_reconfig(&mut packets);
                self.gather_fast_retransmissions(&mut packets);
                self.gather_sack(&mut packets);
                self.gather_forward_tsn(&mut packets);
            }
            AssociationState::ShutdownPending
            | AssociationState::ShutdownSent
            | AssociationState::ShutdownReceived => {
                self.gather_retransmissions(&mut packets);
                self.gather_data_and_reconfig(&mut packets);
                self.gather_fast_retransmissions(&mut packets);
                self.gather_sack(&mut packets);
                self.gather_forward_tsn(&mut packets);
                self.gather_shutdown(&mut packets);
            }
            AssociationState::ShutdownAckSent => self.gather_shutdown(&mut packets),
            _ => {}
        }
        packets
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn rtx_timer(&self, id: RtxTimerId) -> &RtxTimer {
        match id {
            RtxTimerId::T1Init => &self.t1_init,
            RtxTimerId::T1Cookie => &self.t1_cookie,
            RtxTimerId::T2Shutdown => &self.t2_shutdown,
            RtxTimerId::T3Rtx => &self.t3_rtx,
            RtxTimerId::Reconfig => &self.reconfig_timer,
        }
    }

    pub(crate) fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Timeout {
                id,
                n_rtos,
                generation,
            } => {
                if !self.rtx_timer(id).is_current(generation) {
                    return;
                }
                debug!(name = %self.name, timer = %id, n_rtos, "retransmission timeout");
                match id {
                    RtxTimerId::T1Init => self.send_init(),
                    RtxTimerId::T1Cookie => self.send_cookie_echo(),
                    RtxTimerId::T2Shutdown => match self.state {
                        AssociationState::ShutdownSent => self.will_send_shutdown = true,
                        AssociationState::ShutdownAckSent => self.will_send_shutdown_ack = true,
                        _ => {}
                    },
                    RtxTimerId::T3Rtx => self.on_t3_timeout(),
                    RtxTimerId::Reconfig => self.will_retransmit_reconfig = true,
                }
            }
            TimerEvent::Failure { id, generation } => {
                if self.rtx_timer(id).is_current(generation) {
                    self.terminate(AssociationError::RetransmissionFailure(id));
                }
            }
            TimerEvent::AckTimeout { generation } => {
                if self.ack_timer.is_current(generation) {
                    self.counters.ack_timeouts += 1;
                    self.sack_needed = true;
                }
            }
        }
    }

    // =========================================================================
    // Stream operations
    // =========================================================================

    pub(crate) fn open_stream(
        &mut self,
        stream_id: u16,
        ppi: PayloadProtocolIdentifier,
    ) -> Result<(), AssociationError> {
        if self.terminated.is_some() {
            return Err(self.closed_error());
        }
        if self.state != AssociationState::Established {
            return Err(AssociationError::InvalidState(self.state));
        }
        // The id is free again once its reset request has gone out.
        if self.streams.contains_key(&stream_id) || self.pending.has_reset(stream_id) {
            return Err(AssociationError::StreamAlreadyExists(stream_id));
        }
        debug!(name = %self.name, stream_id, "opening stream");
        self.streams.insert(stream_id, StreamState::new(stream_id, ppi));
        Ok(())
    }

    /// `None` while no stream is waiting and the association is alive.
    pub(crate) fn try_accept(&mut self) -> Option<Result<u16, AssociationError>> {
        if let Some(stream_id) = self.accept_queue.pop_front() {
            return Some(Ok(stream_id));
        }
        self.terminated.clone().map(Err)
    }

    /// `None` while no message is ready. An empty payload means end of
    /// stream.
    pub(crate) fn try_read(
        &mut self,
        stream_id: u16,
        capacity: usize,
    ) -> Option<Result<(Bytes, PayloadProtocolIdentifier), AssociationError>> {
        let detached_drained = self
            .detached
            .get(&stream_id)
            .and_then(VecDeque::front)
            .map(|queue| queue.next_message_len().is_none());
        if detached_drained == Some(true) {
            self.pop_detached(stream_id);
            return Some(Ok((Bytes::new(), PayloadProtocolIdentifier::UNKNOWN)));
        }
        let queue = match self
            .detached
            .get_mut(&stream_id)
            .and_then(VecDeque::front_mut)
        {
            Some(queue) => queue,
            None => match self.streams.get_mut(&stream_id) {
                Some(stream) => &mut stream.reassembly,
                None => return Some(Err(AssociationError::StreamClosed)),
            },
        };

        let Some(len) = queue.next_message_len() else {
            return self.terminated.clone().map(Err);
        };
        if len > capacity {
            return Some(Err(AssociationError::ShortBuffer {
                needed: len,
                available: capacity,
            }));
        }

        let mut buf = vec![0u8; len];
        let (n, ppi) = queue.read(&mut buf).ok()?;
        buf.truncate(n);
        self.on_read();
        Some(Ok((Bytes::from(buf), ppi)))
    }

    /// Drop the oldest detached incarnation of `stream_id`; its reader has
    /// seen end of stream.
    fn pop_detached(&mut self, stream_id: u16) {
        if let Some(queues) = self.detached.get_mut(&stream_id) {
            queues.pop_front();
            if queues.is_empty() {
                self.detached.remove(&stream_id);
            }
        }
    }

    /// `None` while the send buffer is full.
    pub(crate) fn try_write(
        &mut self,
        stream_id: u16,
        data: &Bytes,
        ppi: Option<PayloadProtocolIdentifier>,
    ) -> Option<Result<usize, AssociationError>> {
        if self.terminated.is_some() || self.state != AssociationState::Established {
            return Some(Err(self.closed_error()));
        }
        let max_message_size = self.config.max_message_size as usize;
        let max_payload = self.config.max_payload_size();
        let buffered = self.pending.n_bytes() + self.inflight.n_bytes();
        let limit = self.config.max_send_buffer_size;

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Some(Err(AssociationError::StreamClosed));
        };
        if stream.status != StreamStatus::Open {
            return Some(Err(AssociationError::StreamClosed));
        }
        if data.len() > max_message_size {
            return Some(Err(AssociationError::MessageTooLarge {
                size: data.len(),
                max: max_message_size,
            }));
        }
        if data.is_empty() {
            return Some(Ok(0));
        }
        // A single message may always be queued into an empty buffer.
        if buffered > 0 && buffered + data.len() > limit {
            return None;
        }

        let ppi = ppi.unwrap_or(stream.default_ppi);
        let chunks = stream.packetize(data, ppi, max_payload);
        stream.buffered_amount += data.len();
        self.pending.append(chunks);
        Some(Ok(data.len()))
    }

    pub(crate) fn set_reliability(
        &mut self,
        stream_id: u16,
        unordered: bool,
        reliability: ReliabilityType,
        value: u32,
    ) -> Result<(), AssociationError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(AssociationError::StreamClosed)?;
        stream.unordered = unordered;
        stream.reliability = reliability;
        stream.reliability_value = value;
        Ok(())
    }

    /// Queue an outgoing reset behind the stream's data. Idempotent.
    pub(crate) fn close_stream(&mut self, stream_id: u16) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.status != StreamStatus::Open {
            return;
        }
        stream.status = StreamStatus::Closing;
        self.pending.push_reset(stream_id);
        debug!(name = %self.name, stream_id, "closing stream");
    }

    pub(crate) fn stream_status(&self, stream_id: u16) -> StreamStatus {
        self.streams
            .get(&stream_id)
            .map_or(StreamStatus::Closed, |s| s.status)
    }

    pub(crate) fn buffered_amount(&self, stream_id: u16) -> usize {
        self.streams
            .get(&stream_id)
            .map_or(0, |s| s.buffered_amount)
    }
}

/// Extensions advertised in INIT and INIT-ACK.
fn supported_extensions() -> Vec<Param> {
    vec![Param::SupportedExtensions(vec![
        ChunkType::Reconfig.as_byte(),
        ChunkType::ForwardTsn.as_byte(),
    ])]
}

/// Mandatory INIT/INIT-ACK field checks (RFC 4960 3.3.2).
fn check_init(init: &InitChunk) -> Result<(), &'static str> {
    if init.initiate_tag == 0 {
        return Err("zero initiate tag");
    }
    if init.num_inbound_streams == 0 || init.num_outbound_streams == 0 {
        return Err("zero stream count");
    }
    if init.a_rwnd < MIN_INIT_A_RWND {
        return Err("advertised window below 1500 bytes");
    }
    Ok(())
}
