//! Lifecycle Controller
//!
//! `PacketHolder` owns the rule set, the sockets of a relay run and the two
//! loop tasks. A run goes `Idle -> Starting -> Running -> Stopping -> Idle`;
//! a failure while starting drops straight back to `Idle`.

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{ConnectionManager, RetryPolicy};
use crate::error::{HolderError, HolderResult};
use crate::holding::{HoldingRuleSet, ReleaseType, RuleInfo};
use crate::metrics::Metrics;
use crate::relay::{LoopExit, PacketEvent, PacketMonitor, RelayEngine, RelaySession, SessionStats};

/// Relay lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// How `start()` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Return only after the run has ended
    Blocking,
    /// Set up and run the relay on a supervisor task, return immediately
    Background,
}

/// Snapshot of the relay for operators
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub state: RelayState,
    pub bind_addr: Option<SocketAddr>,
    pub listen_addr: Option<SocketAddr>,
    pub client_addr: Option<SocketAddr>,
    pub upstream_addr: Option<SocketAddr>,
    pub upstream_connected: bool,
    pub pending: usize,
    /// Milliseconds the oldest held packet has been waiting
    pub oldest_pending_ms: Option<u64>,
    pub only_held: bool,
    pub last_error: Option<String>,
    pub session: Option<SessionStats>,
}

impl RelayStatus {
    fn idle(only_held: bool) -> Self {
        Self {
            state: RelayState::Idle,
            bind_addr: None,
            listen_addr: None,
            client_addr: None,
            upstream_addr: None,
            upstream_connected: false,
            pending: 0,
            oldest_pending_ms: None,
            only_held,
            last_error: None,
            session: None,
        }
    }
}

/// Shutdown receivers handed out before setup begins so no stop is missed
struct ShutdownReceivers {
    startup: broadcast::Receiver<()>,
    client: broadcast::Receiver<()>,
    server: broadcast::Receiver<()>,
    writes: broadcast::Receiver<()>,
}

struct Inner {
    rules: RwLock<HoldingRuleSet>,
    policy: RwLock<RetryPolicy>,
    monitor: Arc<PacketMonitor>,
    metrics: Arc<Metrics>,
    status: watch::Sender<RelayStatus>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    engine: Mutex<Option<Arc<RelayEngine>>>,
}

/// Intercepting relay between one client and one upstream server
#[derive(Clone)]
pub struct PacketHolder {
    inner: Arc<Inner>,
}

impl Default for PacketHolder {
    fn default() -> Self {
        Self::with_rule_slots(1)
    }
}

impl PacketHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a holder with `slots` disabled indexed rules
    pub fn with_rule_slots(slots: usize) -> Self {
        Self::from_parts(
            HoldingRuleSet::with_slots(slots),
            RetryPolicy::default(),
            false,
            Arc::new(Metrics::new()),
        )
    }

    pub fn from_parts(
        rules: HoldingRuleSet,
        policy: RetryPolicy,
        only_held: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (status, _) = watch::channel(RelayStatus::idle(only_held));
        Self {
            inner: Arc::new(Inner {
                rules: RwLock::new(rules),
                policy: RwLock::new(policy),
                monitor: Arc::new(PacketMonitor::new(only_held)),
                metrics,
                status,
                shutdown: Mutex::new(None),
                engine: Mutex::new(None),
            }),
        }
    }

    /// Build a holder from the rules, keywords and retry settings of a config
    pub fn from_config(config: &Config) -> crate::Result<Self> {
        let rules = config.build_rule_set()?;
        Ok(Self::from_parts(
            rules,
            RetryPolicy::from(&config.upstream),
            config.relay.only_held_output,
            Arc::new(Metrics::new()),
        ))
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        read(&self.inner.policy).clone()
    }

    /// Replace the upstream retry policy used by the next run
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        *write(&self.inner.policy) = policy;
    }

    // Rule management

    /// Replace indexed rule `index`
    ///
    /// Only allowed while idle; invalid indexes and patterns leave the rule
    /// set untouched.
    pub fn configure_rule(
        &self,
        index: usize,
        hold_keyword: &str,
        release_type: ReleaseType,
        release_keyword: &str,
        enabled: bool,
    ) -> HolderResult<()> {
        self.mutate_rules(|rules| {
            rules.configure_rule(index, hold_keyword, release_type, release_keyword, enabled)
        })
    }

    /// Append a keyword rule released only by a manual flush
    pub fn register_keyword(&self, keyword: &str) -> HolderResult<()> {
        self.mutate_rules(|rules| rules.register_keyword(keyword))
    }

    pub fn clear_keywords(&self) -> HolderResult<()> {
        self.mutate_rules(|rules| {
            rules.clear_keywords();
            Ok(())
        })
    }

    /// Turn holding by keyword on or off without forgetting the keywords
    pub fn set_holding_enabled(&self, enabled: bool) -> HolderResult<()> {
        self.mutate_rules(|rules| {
            rules.set_keyword_holding(enabled);
            info!("Keyword holding {}", if enabled { "enabled" } else { "disabled" });
            Ok(())
        })
    }

    pub fn holding_enabled(&self) -> bool {
        read(&self.inner.rules).keyword_holding()
    }

    pub fn rules(&self) -> Vec<RuleInfo> {
        read(&self.inner.rules).infos()
    }

    fn mutate_rules<F>(&self, mutate: F) -> HolderResult<()>
    where
        F: FnOnce(&mut HoldingRuleSet) -> HolderResult<()>,
    {
        // The write lock is held across the state check so a concurrent
        // start() snapshots either the old or the new rule set.
        let mut rules = write(&self.inner.rules);
        let state = self.inner.status.borrow().state;
        if state != RelayState::Idle {
            warn!("Rules cannot be changed while the relay is {:?}", state);
            return Err(HolderError::RulesLocked);
        }
        mutate(&mut rules)
    }

    // Lifecycle

    /// Start a relay run from `bind_addr` to `upstream_addr`
    ///
    /// Binds, accepts one client and connects upstream, then runs both relay
    /// loops. In `Blocking` mode the call returns when the run ends; in
    /// `Background` mode it returns as soon as the run is scheduled and
    /// setup failures are reported through `status().last_error`.
    pub async fn start(
        &self,
        bind_addr: SocketAddr,
        upstream_addr: SocketAddr,
        mode: StartMode,
    ) -> HolderResult<()> {
        let mut previous = RelayState::Idle;
        let claimed = self.inner.status.send_if_modified(|status| {
            previous = status.state;
            if status.state != RelayState::Idle {
                return false;
            }
            let only_held = status.only_held;
            *status = RelayStatus::idle(only_held);
            status.state = RelayState::Starting;
            status.bind_addr = Some(bind_addr);
            status.upstream_addr = Some(upstream_addr);
            true
        });
        if !claimed {
            warn!("start() ignored: packet holder is already {:?}", previous);
            return Err(HolderError::AlreadyRunning);
        }

        let rules = Arc::new(read(&self.inner.rules).clone());
        let (shutdown_tx, startup) = broadcast::channel(1);
        let receivers = ShutdownReceivers {
            startup,
            client: shutdown_tx.subscribe(),
            server: shutdown_tx.subscribe(),
            writes: shutdown_tx.subscribe(),
        };
        *lock(&self.inner.shutdown) = Some(shutdown_tx);

        info!("Starting packet holder: {} -> {}", bind_addr, upstream_addr);
        match mode {
            StartMode::Blocking => self.run(bind_addr, upstream_addr, rules, receivers).await,
            StartMode::Background => {
                let holder = self.clone();
                tokio::spawn(async move {
                    // Errors are logged and recorded in the status by run()
                    let _ = holder.run(bind_addr, upstream_addr, rules, receivers).await;
                });
                Ok(())
            }
        }
    }

    /// Stop the current run and wait until the relay is idle again
    ///
    /// Both loops are signalled and any write they are blocked in is
    /// abandoned, so a peer that stopped reading cannot hold the stop up.
    /// The loops are then joined and their sockets closed. Packets still
    /// held are discarded.
    pub async fn stop(&self) -> HolderResult<()> {
        let mut previous = RelayState::Idle;
        self.inner.status.send_if_modified(|status| {
            previous = status.state;
            match status.state {
                RelayState::Starting | RelayState::Running => {
                    status.state = RelayState::Stopping;
                    true
                }
                _ => false,
            }
        });
        if previous == RelayState::Idle {
            warn!("stop() ignored: packet holder is not running");
            return Err(HolderError::NotRunning);
        }

        info!("Stopping packet holder");
        let shutdown = lock(&self.inner.shutdown).clone();
        if let Some(shutdown) = shutdown {
            // Loops that already ended have dropped their receivers
            let _ = shutdown.send(());
        }

        self.wait_for_status(|status| status.state == RelayState::Idle)
            .await;
        info!("Packet holder stopped");
        Ok(())
    }

    /// Release every held packet to the upstream server
    ///
    /// Returns the number of packets sent.
    pub async fn flush_all_pending(&self) -> HolderResult<usize> {
        let engine = match self.engine() {
            Some(engine) => engine,
            None => {
                warn!("flush_all_pending() ignored: packet holder is not running");
                return Err(HolderError::NotRunning);
            }
        };
        Ok(engine.flush_all_pending().await)
    }

    /// Only report held and released packets when `only_held` is set
    pub fn set_output_verbosity(&self, only_held: bool) {
        self.inner.monitor.set_only_held(only_held);
        self.inner.status.send_modify(|status| status.only_held = only_held);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PacketEvent> {
        self.inner.monitor.subscribe()
    }

    pub fn state(&self) -> RelayState {
        self.inner.status.borrow().state
    }

    /// Current status with live pending and session counters
    pub fn status(&self) -> RelayStatus {
        let mut status = self.inner.status.borrow().clone();
        if let Some(engine) = self.engine() {
            status.pending = engine.pending_count();
            status.oldest_pending_ms = engine.oldest_pending_age().map(duration_ms);
            status.session = Some(engine.session().to_stats());
        }
        status
    }

    /// Lifecycle updates; `pending` and `session` are not live here
    pub fn subscribe_status(&self) -> watch::Receiver<RelayStatus> {
        self.inner.status.subscribe()
    }

    /// Wait until the published status satisfies `done`
    pub async fn wait_for_status<F>(&self, done: F) -> RelayStatus
    where
        F: Fn(&RelayStatus) -> bool,
    {
        let mut updates = self.inner.status.subscribe();
        loop {
            {
                let status = updates.borrow_and_update();
                if done(&status) {
                    return RelayStatus::clone(&status);
                }
            }
            if updates.changed().await.is_err() {
                return self.inner.status.borrow().clone();
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.engine().map_or(0, |engine| engine.pending_count())
    }

    /// How long the oldest held packet has been waiting
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.engine().and_then(|engine| engine.oldest_pending_age())
    }

    fn engine(&self) -> Option<Arc<RelayEngine>> {
        lock(&self.inner.engine).clone()
    }

    /// Supervisor of one relay run
    async fn run(
        &self,
        bind_addr: SocketAddr,
        upstream_addr: SocketAddr,
        rules: Arc<HoldingRuleSet>,
        receivers: ShutdownReceivers,
    ) -> HolderResult<()> {
        let ShutdownReceivers {
            mut startup,
            client: client_shutdown,
            server: server_shutdown,
            writes: mut write_shutdown,
        } = receivers;
        let manager = ConnectionManager::new(self.retry_policy(), self.metrics());

        let setup = async {
            let listener = manager.bind(bind_addr)?;
            let listen_addr = listener.local_addr()?;
            self.inner
                .status
                .send_modify(|status| status.listen_addr = Some(listen_addr));

            let (client, client_addr) = manager.accept_client(&listener).await?;
            drop(listener);
            self.inner
                .status
                .send_modify(|status| status.client_addr = Some(client_addr));

            let server = manager.connect_upstream(upstream_addr).await?;
            Ok::<_, HolderError>((client, client_addr, server))
        };

        // Dropping the setup future closes whatever it had opened so far
        let setup = tokio::select! {
            result = setup => result,
            _ = startup.recv() => Err(HolderError::Cancelled),
        };
        let (client, client_addr, server) = match setup {
            Ok(sockets) => sockets,
            Err(e) => {
                error!("Packet holder failed to start: {}", e);
                self.finish(Some(e.to_string()));
                return Err(e);
            }
        };

        let session = Arc::new(RelaySession::new(client_addr, upstream_addr));
        self.inner.metrics.record_session();

        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();
        let engine = Arc::new(RelayEngine::new(
            rules,
            Box::new(server_write),
            Arc::clone(&self.inner.monitor),
            self.metrics(),
            Arc::clone(&session),
        ));
        *lock(&self.inner.engine) = Some(Arc::clone(&engine));

        let canceller = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                if write_shutdown.recv().await.is_ok() {
                    engine.cancel_io();
                }
            })
        };

        let client_loop = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run_client_to_server(client_read, client_shutdown).await })
        };
        let server_loop = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .run_server_to_client(server_read, client_write, server_shutdown)
                    .await
            })
        };

        self.inner.status.send_modify(|status| {
            status.upstream_connected = true;
            if status.state == RelayState::Starting {
                status.state = RelayState::Running;
            }
        });
        info!(
            session_id = %session.session_id,
            "Packet holder running: {} <-> {}", client_addr, upstream_addr
        );

        let (client_exit, server_exit) = tokio::join!(client_loop, server_loop);
        log_loop_result("client-to-server", client_exit);
        log_loop_result("server-to-client", server_exit);
        canceller.abort();
        // A manual flush may still hold the upstream lock
        engine.cancel_io();

        // Both loops are gone; finish the run whether or not stop() asked for it
        self.inner.status.send_modify(|status| {
            if status.state == RelayState::Running {
                status.state = RelayState::Stopping;
            }
        });
        engine.close_upstream().await;
        let discarded = engine.discard_pending();
        if discarded > 0 {
            info!("{} held packet(s) discarded at stop", discarded);
        }
        session.log_stats();
        lock(&self.inner.engine).take();

        self.finish(None);
        Ok(())
    }

    /// Return to idle, keeping the configured addresses for display
    fn finish(&self, last_error: Option<String>) {
        lock(&self.inner.shutdown).take();
        self.inner.status.send_modify(|status| {
            status.state = RelayState::Idle;
            status.listen_addr = None;
            status.client_addr = None;
            status.upstream_connected = false;
            status.pending = 0;
            status.oldest_pending_ms = None;
            status.last_error = last_error;
        });
        debug!("Packet holder is idle");
    }
}

fn log_loop_result(name: &str, result: Result<LoopExit, JoinError>) {
    match result {
        Ok(exit) => debug!("{} loop finished: {:?}", name, exit),
        Err(e) => error!("{} loop task failed: {}", name, e),
    }
}

fn duration_ms(age: Duration) -> u64 {
    u64::try_from(age.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
