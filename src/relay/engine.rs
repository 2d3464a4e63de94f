//! Relay Engine
//!
//! The two forwarding loops of a relay run and the hold/release decisions
//! made for every packet. Both loops and the manual flush write to the
//! upstream server through one lock so frames never interleave. Every write
//! races the engine's cancel flag, so a peer that stops reading cannot keep
//! a loop from seeing a stop.

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use super::monitor::{PacketKind, PacketMonitor};
use super::session::RelaySession;
use crate::config::PACKET_MAX_SIZE;
use crate::holding::{Direction, HoldingRuleSet, PendingPacket, PendingQueue, RuleEvaluation};
use crate::metrics::Metrics;

/// Write side of the upstream connection
pub type UpstreamWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a relay loop ended
#[derive(Debug)]
pub enum LoopExit {
    /// Peer closed its side of the connection
    Eof,
    /// Reading from the peer failed
    ReadError(io::Error),
    /// The controller asked the loop to stop
    Shutdown,
}

/// Per-run relay state shared by both forwarding loops
pub struct RelayEngine {
    rules: Arc<HoldingRuleSet>,
    queue: PendingQueue,
    upstream: Mutex<UpstreamWriter>,
    monitor: Arc<PacketMonitor>,
    metrics: Arc<Metrics>,
    session: Arc<RelaySession>,
    cancel: watch::Sender<bool>,
}

impl RelayEngine {
    /// Create an engine for one run
    ///
    /// `rules` is a snapshot; rule changes made while the engine runs are not
    /// seen until the next run.
    pub fn new(
        rules: Arc<HoldingRuleSet>,
        upstream: UpstreamWriter,
        monitor: Arc<PacketMonitor>,
        metrics: Arc<Metrics>,
        session: Arc<RelaySession>,
    ) -> Self {
        Self {
            rules,
            queue: PendingQueue::new(),
            upstream: Mutex::new(upstream),
            monitor,
            metrics,
            session,
            cancel: watch::channel(false).0,
        }
    }

    pub fn session(&self) -> &Arc<RelaySession> {
        &self.session
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.queue.oldest_age()
    }

    /// Abort in-flight and future writes of this run
    pub fn cancel_io(&self) {
        if !self.cancel.send_replace(true) {
            debug!("Relay writes cancelled for session {}", self.session.session_id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Forward client packets upstream, holding the ones a rule claims
    pub async fn run_client_to_server<R>(
        &self,
        mut client: R,
        mut shutdown: broadcast::Receiver<()>,
    ) -> LoopExit
    where
        R: AsyncRead + Unpin,
    {
        debug!("Client-to-server loop started for session {}", self.session.session_id);
        let mut buf = vec![0u8; PACKET_MAX_SIZE];

        let exit = loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.recv() => break LoopExit::Shutdown,
                read = client.read(&mut buf) => read,
            };

            match read {
                Ok(0) => break LoopExit::Eof,
                Ok(n) => self.handle_client_packet(Bytes::copy_from_slice(&buf[..n])).await,
                Err(e) => break LoopExit::ReadError(e),
            }
        };

        log_exit("client", &exit);
        exit
    }

    /// Forward server packets to the client and release what they trigger
    pub async fn run_server_to_client<R, W>(
        &self,
        mut server: R,
        mut client: W,
        mut shutdown: broadcast::Receiver<()>,
    ) -> LoopExit
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        debug!("Server-to-client loop started for session {}", self.session.session_id);
        let mut buf = vec![0u8; PACKET_MAX_SIZE];

        let exit = loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.recv() => break LoopExit::Shutdown,
                read = server.read(&mut buf) => read,
            };

            match read {
                Ok(0) => break LoopExit::Eof,
                Ok(n) => {
                    let packet = Bytes::copy_from_slice(&buf[..n]);
                    self.handle_server_packet(&packet, &mut client).await;
                }
                Err(e) => break LoopExit::ReadError(e),
            }
        };

        log_exit("server", &exit);
        exit
    }

    /// Hold the packet or forward it and release what it triggers
    pub async fn handle_client_packet(&self, packet: Bytes) {
        self.metrics.record_bytes(Direction::ClientToServer, packet.len());
        self.session.add_bytes_up(packet.len() as u64);

        match self.rules.evaluate(Direction::ClientToServer, &packet) {
            RuleEvaluation::Hold(rule) => {
                self.monitor.emit(
                    Direction::ClientToServer,
                    PacketKind::Holding,
                    Some(rule.index),
                    &packet,
                );
                self.metrics.record_packet(Direction::ClientToServer, PacketKind::Holding);
                self.session.record_held();
                self.queue.enqueue(packet, rule);
                self.metrics.set_pending(self.queue.len());
            }
            RuleEvaluation::ReleaseMatch(_) | RuleEvaluation::NoMatch => {
                self.send_upstream(&packet, PacketKind::PassThrough, None).await;
                self.release(Direction::ClientToServer, &packet).await;
            }
        }
    }

    /// Pass a server packet to the client, then release what it triggers
    pub async fn handle_server_packet<W>(&self, packet: &Bytes, client: &mut W)
    where
        W: AsyncWrite + Unpin,
    {
        self.metrics.record_bytes(Direction::ServerToClient, packet.len());
        self.session.add_bytes_down(packet.len() as u64);

        self.monitor
            .emit(Direction::ServerToClient, PacketKind::PassThrough, None, packet);
        match self.cancellable(write_packet(client, packet)).await {
            Ok(()) => {
                self.metrics
                    .record_packet(Direction::ServerToClient, PacketKind::PassThrough);
            }
            Err(e) => self.report_send_failure("client", &e),
        }

        // Released packets go upstream, never back to the client
        self.release(Direction::ServerToClient, packet).await;
    }

    /// Send every held packet upstream regardless of its release trigger
    ///
    /// Returns the number of packets released.
    pub async fn flush_all_pending(&self) -> usize {
        let released = self.queue.drain_all();
        self.metrics.set_pending(self.queue.len());
        if released.is_empty() {
            debug!("No pending packets to flush");
            return 0;
        }

        info!("Flushing {} pending packet(s)", released.len());
        self.deliver(released).await
    }

    async fn release(&self, direction: Direction, observed: &[u8]) {
        let released = self.queue.drain_matching(direction, observed);
        if released.is_empty() {
            return;
        }

        self.metrics.set_pending(self.queue.len());
        debug!(
            "{} packet(s) released by {:?} traffic",
            released.len(),
            direction
        );
        self.deliver(released).await;
    }

    async fn deliver(&self, released: Vec<PendingPacket>) -> usize {
        let count = released.len();
        self.session.record_released(count as u64);
        for packet in released {
            debug!(
                "Releasing packet held by rule {} for {:?}",
                packet.rule.index,
                packet.held_at.elapsed()
            );
            self.send_upstream(&packet.payload, PacketKind::Delayed, Some(packet.rule.index))
                .await;
        }
        count
    }

    /// Write one packet upstream under the shared send lock
    ///
    /// Failures are reported and counted; the caller carries on with the
    /// next packet.
    async fn send_upstream(&self, payload: &[u8], kind: PacketKind, rule_index: Option<usize>) -> bool {
        let mut upstream = self.upstream.lock().await;
        self.monitor
            .emit(Direction::ClientToServer, kind, rule_index, payload);

        match self.cancellable(write_packet(&mut *upstream, payload)).await {
            Ok(()) => {
                self.metrics.record_packet(Direction::ClientToServer, kind);
                true
            }
            Err(e) => {
                self.report_send_failure("server", &e);
                false
            }
        }
    }

    /// Run a write until it completes or the engine is cancelled
    async fn cancellable<F>(&self, write: F) -> io::Result<()>
    where
        F: Future<Output = io::Result<()>>,
    {
        let mut cancelled = self.cancel.subscribe();
        tokio::select! {
            biased;
            _ = cancelled.wait_for(|cancelled| *cancelled) => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "relay is stopping",
            )),
            result = write => result,
        }
    }

    fn report_send_failure(&self, peer: &str, error: &io::Error) {
        if self.is_cancelled() {
            debug!("Write to {} abandoned: {}", peer, error);
            return;
        }
        warn!("Sending to {} failed: {}", peer, error);
        self.metrics.record_send_failure();
    }

    /// Shut down the write side of the upstream connection
    pub async fn close_upstream(&self) {
        let mut upstream = self.upstream.lock().await;
        if let Err(e) = upstream.shutdown().await {
            debug!("Upstream shutdown returned: {}", e);
        }
    }

    /// Remove whatever is still held, e.g. when the run ends
    pub fn discard_pending(&self) -> usize {
        let dropped = self.queue.drain_all().len();
        self.metrics.set_pending(0);
        if dropped > 0 {
            warn!("Discarding {} held packet(s) that were never released", dropped);
        }
        dropped
    }
}

async fn write_packet<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(payload).await?;
    writer.flush().await
}

fn log_exit(peer: &str, exit: &LoopExit) {
    match exit {
        LoopExit::Eof => info!("recv() from {} ended: connection closed", peer),
        LoopExit::ReadError(e) => warn!("recv() from {} failed: {}", peer, e),
        LoopExit::Shutdown => info!("Relay loop for {} stopped", peer),
    }
}
