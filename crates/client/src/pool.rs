//! Server pool: the client's view of the brokers it may connect to.
//!
//! The pool holds the configured seed servers plus any peers a broker announced in
//! its server-info gossip. It remembers per-entry connection history and answers one
//! question for the reconnection engine: which server should be tried next?
//!
//! # Selection
//!
//! Entries keep their configured order (optionally shuffled once at construction).
//! Candidates are handed out round-robin starting with the successor of the last
//! server handed out, so after a failover the servers after the one just lost are
//! tried first and the lost server comes last.
//!
//! # Budgets
//!
//! Each entry counts its failed reconnect attempts. An entry that used up
//! `max_reconnect_attempts` is skipped; when every entry is skipped the pool is
//! exhausted and the connection closes. Entries are never removed because of their
//! budget, only discovered entries are replaced by newer gossip.

use std::{
    fmt,
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;
use url::Url;

use crate::error::ClientError;

/// Default port when a server URL does not carry one.
pub const DEFAULT_PORT: u16 = 4222;

const DEFAULT_SCHEME: &str = "nats";

/// A parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    url: Url,
}

impl ServerAddr {
    /// Parses `scheme://host:port`, `host:port` or `host`.
    ///
    /// # Examples
    /// ```ignore
    /// let addr = ServerAddr::parse("node-a:4333")?;
    /// assert_eq!(addr.to_string(), "nats://node-a:4333");
    /// ```
    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ClientError::InvalidUrl("empty server url".into()));
        }

        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("{DEFAULT_SCHEME}://{input}")
        };

        let mut url =
            Url::parse(&with_scheme).map_err(|e| ClientError::InvalidUrl(format!("{input}: {e}")))?;

        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(ClientError::InvalidUrl(format!("{input}: missing host"))),
        }

        if url.port().is_none() {
            url.set_port(Some(DEFAULT_PORT))
                .map_err(|_| ClientError::InvalidUrl(format!("{input}: cannot carry a port")))?;
        }

        Ok(ServerAddr { url })
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or(DEFAULT_PORT)
    }

    /// `host:port`, the form brokers use in gossip.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.url.scheme(), self.host(), self.port())
    }
}

/// One known server and its connection history.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    /// Broker address.
    pub addr: ServerAddr,

    /// Learned from gossip rather than configured.
    pub discovered: bool,

    /// When the last connect attempt to this server started.
    pub last_attempt: Option<Instant>,

    /// Whether a session to this server was ever established.
    pub did_connect: bool,

    /// Failed reconnect attempts since the last successful session.
    pub reconnects: u32,
}

impl ServerEntry {
    fn new(addr: ServerAddr, discovered: bool) -> Self {
        ServerEntry {
            addr,
            discovered,
            last_attempt: None,
            did_connect: false,
            reconnects: 0,
        }
    }

    fn is_exhausted(&self, max_reconnect: Option<u32>) -> bool {
        max_reconnect.is_some_and(|max| self.reconnects >= max)
    }
}

/// Ordered set of candidate servers.
#[derive(Debug, Clone)]
pub struct ServerPool {
    entries: Vec<ServerEntry>,

    /// Server the current (or last) session was established with.
    connected: Option<ServerAddr>,

    /// Last candidate handed out by `next_candidate`.
    cursor: Option<ServerAddr>,

    randomize: bool,
}

impl ServerPool {
    /// Builds the pool from the configured seed URLs.
    ///
    /// Duplicate URLs are collapsed. With `randomize` the seeds are shuffled once here
    /// and never again.
    pub fn new(urls: &[String], randomize: bool) -> Result<Self, ClientError> {
        let mut entries: Vec<ServerEntry> = Vec::with_capacity(urls.len());
        for url in urls {
            let addr = ServerAddr::parse(url)?;
            if !entries.iter().any(|e| e.addr == addr) {
                entries.push(ServerEntry::new(addr, false));
            }
        }

        if entries.is_empty() {
            return Err(ClientError::NoServers);
        }

        if randomize {
            entries.shuffle(&mut rand::thread_rng());
        }

        Ok(ServerPool {
            entries,
            connected: None,
            cursor: None,
            randomize,
        })
    }

    pub fn entries(&self) -> &[ServerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry of the server the current session runs against.
    pub fn current(&self) -> Option<&ServerEntry> {
        let connected = self.connected.as_ref()?;
        self.entries.iter().find(|e| &e.addr == connected)
    }

    /// Every address in selection order, for the initial connect pass.
    pub fn initial_order(&self) -> Vec<ServerAddr> {
        self.entries.iter().map(|e| e.addr.clone()).collect()
    }

    /// Returns the next server worth a reconnect attempt, or `None` when every entry
    /// spent its budget.
    pub fn next_candidate(&mut self, max_reconnect: Option<u32>) -> Option<ServerAddr> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }

        let start = self
            .cursor
            .as_ref()
            .or(self.connected.as_ref())
            .and_then(|addr| self.position(addr))
            .map_or(0, |idx| idx + 1);

        let picked = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| !self.entries[idx].is_exhausted(max_reconnect))?;

        let addr = self.entries[picked].addr.clone();
        self.cursor = Some(addr.clone());
        Some(addr)
    }

    /// How long to wait before `addr` may be tried again given the current delay.
    pub fn wait_before(&self, addr: &ServerAddr, delay: Duration) -> Duration {
        self.entry(addr)
            .and_then(|e| e.last_attempt)
            .map_or(Duration::ZERO, |last| delay.saturating_sub(last.elapsed()))
    }

    /// Stamps the start of a connect attempt.
    pub fn record_attempt(&mut self, addr: &ServerAddr) {
        if let Some(entry) = self.entry_mut(addr) {
            entry.last_attempt = Some(Instant::now());
        }
    }

    /// Counts a failed reconnect attempt against the entry's budget.
    pub fn record_failure(&mut self, addr: &ServerAddr) {
        if let Some(entry) = self.entry_mut(addr) {
            entry.reconnects = entry.reconnects.saturating_add(1);
        }
    }

    /// Marks `addr` as the server of the live session and refills its budget.
    pub fn mark_connected(&mut self, addr: &ServerAddr) {
        if let Some(entry) = self.entry_mut(addr) {
            entry.did_connect = true;
            entry.reconnects = 0;
        }
        self.connected = Some(addr.clone());
        self.cursor = Some(addr.clone());
    }

    /// Applies a peer list announced by a broker.
    ///
    /// Configured entries and the connected server stay where they are. Discovered
    /// entries missing from the new list are dropped; announced peers not yet known
    /// are appended (shuffled when the pool randomizes). Entries that survive keep
    /// their history.
    ///
    /// # Returns
    /// The newly added addresses.
    pub fn update_discovered(&mut self, urls: &[String]) -> Vec<ServerAddr> {
        let announced: Vec<ServerAddr> = urls
            .iter()
            .filter_map(|url| ServerAddr::parse(url).ok())
            .collect();

        let connected = self.connected.clone();
        self.entries.retain(|e| {
            !e.discovered || Some(&e.addr) == connected.as_ref() || announced.contains(&e.addr)
        });

        let mut added: Vec<ServerAddr> = Vec::new();
        for addr in announced {
            if self.position(&addr).is_none() && !added.contains(&addr) {
                added.push(addr);
            }
        }

        if self.randomize {
            added.shuffle(&mut rand::thread_rng());
        }

        self.entries
            .extend(added.iter().cloned().map(|addr| ServerEntry::new(addr, true)));

        added
    }

    fn position(&self, addr: &ServerAddr) -> Option<usize> {
        self.entries.iter().position(|e| &e.addr == addr)
    }

    fn entry(&self, addr: &ServerAddr) -> Option<&ServerEntry> {
        self.entries.iter().find(|e| &e.addr == addr)
    }

    fn entry_mut(&mut self, addr: &ServerAddr) -> Option<&mut ServerEntry> {
        self.entries.iter_mut().find(|e| &e.addr == addr)
    }
}
