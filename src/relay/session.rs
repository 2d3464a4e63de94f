//! Relay Session

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Counters for one relay run (one accepted client)
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    packets_held: AtomicU64,
    packets_released: AtomicU64,
}

/// Statistics snapshot of a relay session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub packets_held: u64,
    pub packets_released: u64,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(client_addr: SocketAddr, upstream_addr: SocketAddr) -> Self {
        let session_id = format!("relay_{}", Uuid::new_v4().simple());
        debug!(
            "Creating new relay session: {} ({} -> {})",
            session_id, client_addr, upstream_addr
        );

        Self {
            session_id,
            client_addr,
            upstream_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            packets_held: AtomicU64::new(0),
            packets_released: AtomicU64::new(0),
        }
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_held(&self) {
        self.packets_held.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self, count: u64) {
        self.packets_released.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn packets_held(&self) -> u64 {
        self.packets_held.load(Ordering::Relaxed)
    }

    pub fn packets_released(&self) -> u64 {
        self.packets_released.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Generate session statistics
    pub fn to_stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id.clone(),
            client_addr: self.client_addr,
            upstream_addr: self.upstream_addr,
            duration_ms: self.duration().as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            packets_held: self.packets_held(),
            packets_released: self.packets_released(),
        }
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            client_addr = %self.client_addr,
            upstream_addr = %self.upstream_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            packets_held = self.packets_held(),
            packets_released = self.packets_released(),
            "Relay session completed"
        );
    }
}
