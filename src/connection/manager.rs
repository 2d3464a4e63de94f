//! Connection Manager Implementation

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, instrument, warn};

use crate::config::UpstreamConfig;
use crate::error::{HolderError, HolderResult};
use crate::metrics::Metrics;

/// Upstream connect retry budget
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
    pub retry_on_refused: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&UpstreamConfig::default())
    }
}

impl From<&UpstreamConfig> for RetryPolicy {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            retry_interval: config.retry_interval,
            connect_timeout: config.connect_timeout,
            retry_on_refused: config.retry_on_refused,
        }
    }
}

impl RetryPolicy {
    /// Whether a failed attempt may be followed by another one
    pub fn is_retryable(&self, error: &io::Error) -> bool {
        match error.kind() {
            io::ErrorKind::TimedOut => true,
            io::ErrorKind::ConnectionRefused => self.retry_on_refused,
            _ => false,
        }
    }
}

/// Sets up the client and upstream sockets for one relay run
pub struct ConnectionManager {
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager
    pub fn new(policy: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Create a listening socket with a backlog of one
    pub fn bind(&self, bind_addr: SocketAddr) -> HolderResult<TcpListener> {
        let bind_error = |source| HolderError::Bind {
            addr: bind_addr,
            source,
        };

        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;

        #[cfg(unix)]
        socket.set_reuseaddr(true).map_err(bind_error)?;

        info!("Binding to {}", bind_addr);
        socket.bind(bind_addr).map_err(bind_error)?;

        let listener = socket.listen(1).map_err(bind_error)?;
        debug!("Listening on {:?}", listener.local_addr().ok());
        Ok(listener)
    }

    /// Accept exactly one client from the listener
    pub async fn accept_client(
        &self,
        listener: &TcpListener,
    ) -> HolderResult<(TcpStream, SocketAddr)> {
        let local_addr = listener.local_addr()?;
        info!("Accepting client on {}", local_addr);

        let (stream, client_addr) = listener.accept().await.map_err(|source| HolderError::Accept {
            addr: local_addr,
            source,
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on client socket: {}", e);
        }

        info!("Accepted client {}", client_addr);
        Ok((stream, client_addr))
    }

    /// Bind, listen and accept a single client
    ///
    /// The listening socket is dropped once the client is accepted; one
    /// client is served per relay run.
    pub async fn bind_and_accept(
        &self,
        bind_addr: SocketAddr,
    ) -> HolderResult<(TcpStream, SocketAddr)> {
        let listener = self.bind(bind_addr)?;
        self.accept_client(&listener).await
    }

    /// Connect to the upstream server, retrying on timeouts
    ///
    /// A refused connection aborts immediately unless the policy says
    /// otherwise; any other error always aborts.
    #[instrument(skip(self), fields(retry_count = self.policy.retry_count))]
    pub async fn connect_upstream(&self, upstream_addr: SocketAddr) -> HolderResult<TcpStream> {
        info!("Connecting to upstream server {}", upstream_addr);
        let retry_count = self.policy.retry_count.max(1);

        for attempt in 1..=retry_count {
            self.metrics.record_connect_attempt();

            let error = match timeout(self.policy.connect_timeout, TcpStream::connect(upstream_addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY on upstream socket: {}", e);
                    }
                    info!("Connected to upstream server {} (attempt {})", upstream_addr, attempt);
                    return Ok(stream);
                }
                Ok(Err(e)) => e,
                Err(_) => io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", self.policy.connect_timeout),
                ),
            };

            if !self.policy.is_retryable(&error) {
                warn!("Connecting to upstream {} failed: {}", upstream_addr, error);
                return Err(match error.kind() {
                    io::ErrorKind::ConnectionRefused => HolderError::UpstreamRefused {
                        addr: upstream_addr,
                        attempts: attempt,
                        source: error,
                    },
                    _ => HolderError::Io(error),
                });
            }

            if attempt < retry_count {
                warn!(
                    "Connecting to upstream {} failed ({}): retrying {} of {} ...",
                    upstream_addr, error, attempt, retry_count
                );
                sleep(self.policy.retry_interval).await;
            } else {
                warn!("Connecting to upstream {} failed ({}): giving up", upstream_addr, error);
            }
        }

        Err(HolderError::UpstreamExhausted {
            addr: upstream_addr,
            attempts: retry_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn manager(policy: RetryPolicy) -> (ConnectionManager, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        (ConnectionManager::new(policy, Arc::clone(&metrics)), metrics)
    }

    fn fast_policy(retry_count: u32, retry_on_refused: bool) -> RetryPolicy {
        RetryPolicy {
            retry_count,
            retry_interval: Duration::ZERO,
            connect_timeout: Duration::from_secs(2),
            retry_on_refused,
        }
    }

    /// An address that nothing listens on
    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[test]
    fn test_default_policy_matches_constants() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retry_count, 100);
        assert_eq!(policy.retry_interval, Duration::from_secs(3));
        assert!(!policy.retry_on_refused);
    }

    #[test]
    fn test_retry_classification() {
        let policy = fast_policy(3, false);
        assert!(policy.is_retryable(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!policy.is_retryable(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!policy.is_retryable(&io::Error::from(io::ErrorKind::PermissionDenied)));

        let policy = fast_policy(3, true);
        assert!(policy.is_retryable(&io::Error::from(io::ErrorKind::ConnectionRefused)));
    }

    #[tokio::test]
    async fn test_connect_upstream_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(b"hello").await;
            }
        });

        let (manager, metrics) = manager(fast_policy(3, false));
        let mut stream = manager.connect_upstream(addr).await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(metrics.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_retried() {
        let addr = closed_port().await;
        let (manager, metrics) = manager(fast_policy(3, false));

        let err = manager.connect_upstream(addr).await.unwrap_err();
        assert!(matches!(err, HolderError::UpstreamRefused { attempts: 1, .. }));
        assert_eq!(metrics.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_refused_connection_retried_when_configured() {
        let addr = closed_port().await;
        let (manager, metrics) = manager(fast_policy(3, true));

        let err = manager.connect_upstream(addr).await.unwrap_err();
        assert!(matches!(err, HolderError::UpstreamExhausted { attempts: 3, .. }));
        assert_eq!(metrics.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let (manager, _) = manager(fast_policy(1, false));
        let first = manager.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();

        // A second active listener on the same port must fail even with SO_REUSEADDR
        let err = manager.bind(addr).unwrap_err();
        assert!(matches!(err, HolderError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_bind_and_accept_single_client() {
        let (manager, _) = manager(fast_policy(1, false));
        let listener = manager.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_stream, peer) = manager.accept_client(&listener).await.unwrap();
        let client = client.await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
