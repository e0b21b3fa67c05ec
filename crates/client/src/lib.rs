//! # relaybee_client: pub-sub client runtime with failover and ordered consumers
//!
//! An async client library for subject-based messaging brokers. It keeps a
//! connection alive across server failures and gives applications predictable
//! delivery semantics:
//!
//! - **Failover** over a pool of servers with per-server reconnect budgets, wait
//!   intervals and peer discovery
//! - **Subscriptions** with bounded pending queues, slow-consumer detection, pull
//!   delivery and push delivery on a fixed pool of workers
//! - **Auto-unsubscribe** after an exact number of messages
//! - **Ordered consumers** that deliver a stream gaplessly and in order by silently
//!   replacing their subscription when loss is detected
//! - **Event listeners** for connect, disconnect, reconnect, close and async errors
//!
//! The wire is abstracted behind the [`transport::Transport`] trait. The crate ships
//! an in-process broker cluster ([`transport::memory::MemoryNetwork`]) used by the
//! tests and the soak agent.
//!
//! # Quick Start
//!
//! ```ignore
//! use relaybee_client::{ConnectionBuilder, Options, transport::memory::MemoryNetwork};
//!
//! #[tokio::main]
//! async fn main() -> relaybee_client::Result<()> {
//!     let network = MemoryNetwork::new();
//!     network.add_node("nats://127.0.0.1:4222")?;
//!
//!     let conn = ConnectionBuilder::new(Options::default())
//!         .transport(network)
//!         .on_disconnected(|event| eprintln!("{event:?}"))
//!         .connect()
//!         .await?;
//!
//!     let sub = conn.subscribe("greetings.*").await?;
//!     conn.publish("greetings.en", "hello").await?;
//!     let msg = sub.next_msg(std::time::Duration::from_secs(1)).await?;
//!     println!("{}", String::from_utf8_lossy(&msg.payload));
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Application                                  │
//! │ Connection, Subscription, OrderedConsumer    │
//! └──────────────┬───────────────────────────────┘
//!                │
//! ┌──────────────▼───────────────────────────────┐
//! │ Connection core                              │
//! │ state machine, reconnection engine,          │
//! │ registry, outbound buffer, event queue       │
//! └──────┬──────────────────────────┬────────────┘
//!        │                          │
//! ┌──────▼────────────┐   ┌─────────▼────────────┐
//! │ Delivery workers  │   │ ServerPool           │
//! │ (sid-hashed)      │   │ (failover order)     │
//! └───────────────────┘   └─────────┬────────────┘
//!                                   │
//!                       ┌───────────▼────────────┐
//!                       │ Transport              │
//!                       │ EventReader/FrameWriter│
//!                       └────────────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! ```text
//! Connecting ──(session up)──> Connected
//!                                  │
//!                          (session lost)
//!                                  ▼
//!                            Reconnecting ──(pool exhausted)──> Closed
//!                                  │
//!                          (session up, interest resent)
//!                                  ▼
//!                              Connected
//! ```
//!
//! # Error Handling
//!
//! Every public operation returns [`Result<T>`]. Errors that no caller waits for
//! (slow consumers, authorization failures during reconnects) are reported to
//! `AsyncError` listeners instead.

pub mod backoff;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod error;
pub mod events;
pub mod message;
pub mod ordered;
mod outbound;
pub mod pool;
mod registry;
pub mod state;
pub mod subject;
pub mod subscription;
pub mod transport;

// Re-exports: Configuration
pub use config::Options;
// Re-exports: Connection
//
// Entry points of every application
pub use connection::{Connection, ConnectionBuilder, Stats};
// Re-exports: Error handling
pub use error::ClientError;
// Re-exports: Events
pub use events::{ConnectionEvent, EventKind, ListenerId};
// Re-exports: Messages
pub use message::{Headers, Message, SequencePair, StreamMeta};
// Re-exports: Ordered consumers
pub use ordered::{
    ConsumeHandle, ConsumerPhase, DefaultMessageManagerFactory, MessageManagerFactory,
    OrderedConsumer, OrderedConsumerBuilder, OrderedConsumerConfig, OrderedStats,
};
// Re-exports: Server pool
pub use pool::{ServerAddr, ServerEntry, ServerPool};
// Re-exports: State monitoring
pub use state::ConnectionState;
// Re-exports: Subscriptions
pub use subscription::{MessageHandler, MessageManager, PendingSink, SubscribeOptions, Subscription};
// Re-exports: Transport
pub use transport::{Transport, TransportError};

/// Result type of client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
