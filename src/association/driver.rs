//! The task that owns an association.
//!
//! Handles, the transport reader and the timers all feed one `select!`
//! loop. Requests that cannot complete yet (reads with nothing buffered,
//! writes against a full send buffer, accepts, shutdown) are parked and
//! retried after every input.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::config::Config;
use super::error::AssociationError;
use super::internal::AssociationInternal;
use super::{AssociationState, Command, Reply};
use crate::chunk::PayloadProtocolIdentifier;
use crate::codec::BufferPool;
use crate::core::RECEIVE_MTU;
use crate::timer::TimerEvent;
use crate::transport::Conn;

/// Datagrams buffered between the reader task and the driver.
const INBOUND_QUEUE_SIZE: usize = 256;

struct PendingRead {
    stream_id: u16,
    capacity: usize,
    reply: Reply<(Bytes, PayloadProtocolIdentifier)>,
}

struct PendingWrite {
    stream_id: u16,
    data: Bytes,
    ppi: Option<PayloadProtocolIdentifier>,
    reply: Reply<usize>,
}

pub(super) struct Driver {
    inner: AssociationInternal,
    conn: Arc<dyn Conn>,
    cmd_rx: mpsc::Receiver<Command>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    pool: BufferPool,

    handshake: Option<oneshot::Sender<Result<(), AssociationError>>>,
    accepts: VecDeque<Reply<u16>>,
    reads: Vec<PendingRead>,
    /// Served strictly in order so messages keep their write order.
    writes: VecDeque<PendingWrite>,
    shutdowns: Vec<Reply<()>>,

    reader: Option<JoinHandle<()>>,
}

impl Driver {
    pub(super) fn new(
        conn: Arc<dyn Conn>,
        config: Config,
        cmd_rx: mpsc::Receiver<Command>,
        handshake: oneshot::Sender<Result<(), AssociationError>>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let pool = BufferPool::new(config.mtu as usize, 16);
        Self {
            inner: AssociationInternal::new(config, timer_tx),
            conn,
            cmd_rx,
            timer_rx,
            pool,
            handshake: Some(handshake),
            accepts: VecDeque::new(),
            reads: Vec::new(),
            writes: VecDeque::new(),
            shutdowns: Vec::new(),
            reader: None,
        }
    }

    pub(super) async fn run(mut self, is_client: bool) {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        self.reader = Some(tokio::spawn(read_loop(self.conn.clone(), inbound_tx)));
        debug!(name = %self.inner.name, is_client, "association driver started");

        if is_client {
            self.inner.start_client();
            self.flush().await;
        }

        loop {
            if self.inner.terminated().is_some() {
                if self.reader.is_some() {
                    self.teardown().await;
                }
                // Handles may still drain buffered messages.
                match self.cmd_rx.recv().await {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                }
                self.service_waiters();
                continue;
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!(name = %self.inner.name, "all handles dropped");
                        self.inner.close();
                    }
                },
                datagram = inbound_rx.recv() => {
                    let mut next = datagram;
                    // Drain what is already queued so replies bundle.
                    while let Some(datagram) = next {
                        match datagram {
                            Ok(raw) => self.inner.handle_inbound(&raw),
                            Err(e) => {
                                self.inner.terminate(e.into());
                                break;
                            }
                        }
                        next = inbound_rx.try_recv().ok();
                    }
                },
                Some(event) = self.timer_rx.recv() => self.inner.handle_timer(event),
            }

            self.service_waiters();
            self.flush().await;
        }

        debug!(name = %self.inner.name, "association driver stopped");
    }

    async fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Err(e) = self.conn.close().await {
            debug!(name = %self.inner.name, error = %e, "closing transport failed");
        }
    }

    /// Marshal and send every packet the association wants out.
    async fn flush(&mut self) {
        for packet in self.inner.gather_outbound() {
            let mut buf = self.pool.acquire();
            packet.marshal_to(&mut buf);
            trace!(
                name = %self.inner.name,
                len = buf.len(),
                chunks = packet.chunks.len(),
                "sending packet"
            );
            if let Err(e) = self.conn.send(&buf).await {
                debug!(name = %self.inner.name, error = %e, "send failed");
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::OpenStream {
                stream_id,
                ppi,
                reply,
            } => {
                let _ = reply.send(self.inner.open_stream(stream_id, ppi));
            }
            Command::AcceptStream { reply } => self.accepts.push_back(reply),
            Command::Read {
                stream_id,
                capacity,
                reply,
            } => self.reads.push(PendingRead {
                stream_id,
                capacity,
                reply,
            }),
            Command::Write {
                stream_id,
                data,
                ppi,
                reply,
            } => self.writes.push_back(PendingWrite {
                stream_id,
                data,
                ppi,
                reply,
            }),
            Command::SetReliability {
                stream_id,
                unordered,
                reliability,
                value,
                reply,
            } => {
                let _ = reply.send(self.inner.set_reliability(
                    stream_id,
                    unordered,
                    reliability,
                    value,
                ));
            }
            Command::CloseStream { stream_id, reply } => {
                self.inner.close_stream(stream_id);
                let _ = reply.send(Ok(()));
            }
            Command::StreamStatus { stream_id, reply } => {
                let _ = reply.send(Ok(self.inner.stream_status(stream_id)));
            }
            Command::BufferedAmount { stream_id, reply } => {
                let _ = reply.send(Ok(self.inner.buffered_amount(stream_id)));
            }
            Command::Shutdown { reply } => match self.inner.terminated() {
                Some(reason) => {
                    let _ = reply.send(shutdown_outcome(reason));
                }
                None => match self.inner.shutdown() {
                    Ok(()) => self.shutdowns.push(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
            },
            Command::Close { reply } => {
                self.inner.close();
                let _ = reply.send(Ok(()));
            }
            Command::Stats { reply } => {
                let _ = reply.send(Ok(self.inner.stats()));
            }
        }
    }

    /// Complete every parked request the association can now satisfy.
    fn service_waiters(&mut self) {
        if self.handshake.is_some() {
            let outcome = match self.inner.terminated() {
                Some(reason) => Some(Err(reason.clone())),
                None => {
                    let state = self.inner.state();
                    (state == AssociationState::Established || state.is_shutting_down())
                        .then_some(Ok(()))
                }
            };
            if let Some(outcome) = outcome {
                if let Some(tx) = self.handshake.take() {
                    let _ = tx.send(outcome);
                }
            }
        }

        while !self.accepts.is_empty() {
            let Some(result) = self.inner.try_accept() else {
                break;
            };
            if let Some(reply) = self.accepts.pop_front() {
                let _ = reply.send(result);
            }
        }

        for read in std::mem::take(&mut self.reads) {
            if read.reply.is_closed() {
                continue;
            }
            match self.inner.try_read(read.stream_id, read.capacity) {
                Some(result) => {
                    let _ = read.reply.send(result);
                }
                None => self.reads.push(read),
            }
        }

        while let Some(write) = self.writes.front() {
            if !write.reply.is_closed() {
                let Some(result) = self.inner.try_write(write.stream_id, &write.data, write.ppi)
                else {
                    break;
                };
                if let Some(write) = self.writes.pop_front() {
                    let _ = write.reply.send(result);
                }
            } else {
                self.writes.pop_front();
            }
        }

        if let Some(reason) = self.inner.terminated() {
            for reply in self.shutdowns.drain(..) {
                let _ = reply.send(shutdown_outcome(reason));
            }
        }
    }
}

/// A graceful close resolves `shutdown` successfully; anything else is
/// reported.
fn shutdown_outcome(reason: &AssociationError) -> Result<(), AssociationError> {
    match reason {
        AssociationError::Closed => Ok(()),
        other => Err(other.clone()),
    }
}

/// Forward datagrams from the transport until it fails or the driver is
/// gone.
async fn read_loop(conn: Arc<dyn Conn>, inbound: mpsc::Sender<io::Result<Bytes>>) {
    let mut buf = vec![0u8; RECEIVE_MTU];
    loop {
        let result = conn
            .recv(&mut buf)
            .await
            .map(|n| Bytes::copy_from_slice(&buf[..n]));
        let failed = result.is_err();
        if inbound.send(result).await.is_err() || failed {
            break;
        }
    }
}
