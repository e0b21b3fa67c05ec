//! Soak workload: keeps traffic flowing through a client while its servers fail.
//!
//! The `SoakRunner` waits for readiness, then runs until cancelled:
//!
//! - a probe publisher sending a numbered message every `publish_interval_ms`
//! - a counting push subscription on the probe subject
//! - an ordered consumer on the soak stream that checks every delivery is exactly one
//!   stream sequence after the previous one
//! - a chaos task that drops every session on the node the client is connected to
//! - periodic progress reports
//!
//! Plain subscriptions may lose messages during failover (at-most-once); the ordered
//! consumer must not. An ordering violation is therefore the one result that makes
//! the soak fail.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use relaybee_client::{
    transport::memory::MemoryNetwork, ClientError, Connection, Message, OrderedConsumerConfig,
    SubscribeOptions,
};
use thiserror::Error;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::readiness::Readiness;
use crate::config::soak::SoakConfig;

/// Errors that end a soak run.
#[derive(Error, Debug)]
pub enum SoakError {
    /// A client call failed while setting up the workload.
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// The connection closed before the workload could start.
    #[error("Connection closed before the soak became ready")]
    NeverReady,

    /// The ordered consumer delivered out of order or skipped a sequence.
    #[error("Ordered delivery violated {0} times")]
    OrderViolated(u64),
}

/// Counters of one soak run.
#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    publish_errors: AtomicU64,
    received: AtomicU64,
    ordered: AtomicU64,
    last_ordered_seq: AtomicU64,
    violations: AtomicU64,
    chaos_actions: AtomicU64,
}

/// Snapshot of the soak counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoakReport {
    pub published: u64,
    pub publish_errors: u64,
    pub received: u64,
    pub ordered: u64,
    pub violations: u64,
    pub chaos_actions: u64,
    pub reconnects: u64,
    pub recoveries: u64,
}

impl fmt::Display for SoakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "published={} (errors {}), received={}, ordered={}, violations={}, chaos={}, reconnects={}, recoveries={}",
            self.published,
            self.publish_errors,
            self.received,
            self.ordered,
            self.violations,
            self.chaos_actions,
            self.reconnects,
            self.recoveries
        )
    }
}

/// Drives the soak workload against one connection.
pub struct SoakRunner {
    conn: Connection,
    network: MemoryNetwork,
    config: Arc<SoakConfig>,
    readiness: Readiness,
    counters: Arc<Counters>,
}

impl SoakRunner {
    pub fn new(
        conn: Connection,
        network: MemoryNetwork,
        config: Arc<SoakConfig>,
        readiness: Readiness,
    ) -> Self {
        Self {
            conn,
            network,
            config,
            readiness,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Runs until `cancel` fires or the connection closes, then returns the final report.
    ///
    /// # Errors
    /// - `NeverReady`: the connection closed while waiting for readiness
    /// - `Client`: the subscription or ordered consumer could not be created
    /// - `OrderViolated`: the ordered consumer skipped or repeated a sequence
    pub async fn run(self, cancel: CancellationToken) -> Result<SoakReport, SoakError> {
        self.wait_ready(&cancel).await?;
        if cancel.is_cancelled() {
            return Ok(self.report(0));
        }

        let counters = self.counters.clone();
        let probe = self
            .conn
            .subscribe_with_options(
                SubscribeOptions::new(&self.config.probe_subject)
                    .pending_limits(self.config.pending_msgs_limit, usize::MAX)
                    .handler(move |_msg: Message| {
                        let counters = counters.clone();
                        async move {
                            counters.received.fetch_add(1, Ordering::Relaxed);
                        }
                    }),
            )
            .await?;

        let consumer = self
            .conn
            .ordered_consumer(OrderedConsumerConfig::new(&self.config.stream))
            .start()
            .await?;
        let counters = self.counters.clone();
        let consume = consumer
            .consume(move |msg: Message| {
                let counters = counters.clone();
                async move { verify_order(&counters, &msg) }
            })
            .await?;

        info!(
            "Soak workload started: probe on {}, ordered consumer on {}",
            self.config.probe_subject, self.config.stream
        );

        let tasks = cancel.child_token();
        let publisher = tokio::spawn(run_publisher(
            self.conn.clone(),
            self.config.clone(),
            self.counters.clone(),
            tasks.clone(),
        ));
        let chaos = (self.config.chaos_interval_secs > 0).then(|| {
            tokio::spawn(run_chaos(
                self.conn.clone(),
                self.network.clone(),
                Duration::from_secs(self.config.chaos_interval_secs),
                self.counters.clone(),
                tasks.clone(),
            ))
        });

        let mut ticker = interval(Duration::from_secs(self.config.report_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut state = self.conn.subscribe_state();
        loop {
            if state.borrow_and_update().is_closed() {
                error!("Connection closed, ending soak");
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        error!("Connection closed, ending soak");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.report(consumer.stats().recoveries);
                    if self.readiness.current_state().is_ready() {
                        info!("Soak progress: {report}");
                    } else {
                        warn!("Soak progress ({}): {report}", self.readiness.current_state());
                    }
                }
            }
        }

        tasks.cancel();
        let _ = publisher.await;
        if let Some(chaos) = chaos {
            let _ = chaos.await;
        }

        consume.stop();
        let recoveries = consumer.stats().recoveries;
        consumer.stop().await;
        if let Err(e) = probe.unsubscribe().await {
            debug!("Probe subscription already gone: {e}");
        }

        let report = self.report(recoveries);
        info!("Soak finished: {report}");
        if report.violations > 0 {
            return Err(SoakError::OrderViolated(report.violations));
        }
        Ok(report)
    }

    async fn wait_ready(&self, cancel: &CancellationToken) -> Result<(), SoakError> {
        let mut rx = self.readiness.subscribe();
        if rx.borrow().is_ready() {
            info!("Connection is already ready, starting soak workload");
            return Ok(());
        }

        warn!("Waiting for readiness... Current: {}", *rx.borrow());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = rx.changed() => {
                    if changed.is_err() || self.conn.is_closed() {
                        return Err(SoakError::NeverReady);
                    }
                    let state = rx.borrow().clone();
                    if state.is_ready() {
                        info!("Connection is READY, starting soak workload");
                        return Ok(());
                    }
                    warn!("Still not ready: {}", state);
                }
                _ = sleep(Duration::from_secs(30)) => {
                    if self.conn.is_closed() {
                        return Err(SoakError::NeverReady);
                    }
                    warn!("Still waiting for readiness... Current: {}", *rx.borrow());
                }
            }
        }
    }

    fn report(&self, recoveries: u64) -> SoakReport {
        let c = &self.counters;
        SoakReport {
            published: c.published.load(Ordering::Relaxed),
            publish_errors: c.publish_errors.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            ordered: c.ordered.load(Ordering::Relaxed),
            violations: c.violations.load(Ordering::Relaxed),
            chaos_actions: c.chaos_actions.load(Ordering::Relaxed),
            reconnects: self.conn.stats().reconnects,
            recoveries,
        }
    }
}

/// Counts an ordered delivery and flags any sequence that is not the successor of the
/// previous one.
fn verify_order(counters: &Counters, msg: &Message) {
    let Some(seq) = msg.sequence() else {
        warn!("Ordered delivery without stream metadata on {}", msg.subject);
        return;
    };

    let previous = counters
        .last_ordered_seq
        .swap(seq.stream, Ordering::Relaxed);
    if previous != 0 && seq.stream != previous + 1 {
        error!(
            "Ordered delivery out of sequence: {} after {}",
            seq.stream, previous
        );
        counters.violations.fetch_add(1, Ordering::Relaxed);
    }
    counters.ordered.fetch_add(1, Ordering::Relaxed);
}

async fn run_publisher(
    conn: Connection,
    config: Arc<SoakConfig>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(Duration::from_millis(config.publish_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let stream_subject = stream_subject(&config);
    let mut n: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        n += 1;
        let payload = n.to_string();
        let mut result = conn.publish(&config.probe_subject, payload.clone()).await;
        if result.is_ok() {
            if let Some(subject) = &stream_subject {
                result = conn.publish(subject, payload).await;
            }
        }

        match result {
            Ok(()) => {
                counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_closed() => {
                warn!("Publisher stopped: {e}");
                return;
            }
            Err(e) => {
                counters.publish_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Publish {n} failed: {e}");
            }
        }
    }
}

/// Publish subject feeding the soak stream: the first stream pattern with its wildcard
/// tokens replaced by `probe`.
fn stream_subject(config: &SoakConfig) -> Option<String> {
    let pattern = config.stream_subjects.first()?;
    let subject = pattern
        .split('.')
        .map(|token| match token {
            "*" | ">" => "probe",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".");
    (subject != config.probe_subject).then_some(subject)
}

async fn run_chaos(
    conn: Connection,
    network: MemoryNetwork,
    every: Duration,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(every) => {}
        }

        if conn.is_closed() {
            debug!("Chaos stopped, connection closed");
            return;
        }
        let Some(url) = conn.connected_url() else {
            continue;
        };
        if !conn.is_connected() {
            debug!("Skipping chaos action while not connected");
            continue;
        }

        let dropped = network.disconnect(&url);
        counters.chaos_actions.fetch_add(1, Ordering::Relaxed);
        warn!("Chaos: dropped {dropped} sessions on {url}");
    }
}
