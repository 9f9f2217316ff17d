//! Configuration link.
//!
//! The local provisioning and control surface: a fragmented,
//! MTU-negotiating request/response transport ([`transport`], [`frag`],
//! [`mtu`]), a priority command queue with CRUD/batch/streaming dispatch
//! ([`commands`], [`dispatch`], [`stream`]), and rolling link metrics
//! ([`metrics`]).

pub mod commands;
pub mod dispatch;
pub mod error;
pub mod frag;
pub mod metrics;
pub mod mtu;
pub mod stream;
pub mod transport;

pub use commands::{
    BatchMode, BatchTag, CommandMessage, CommandPriority, CommandQueue, Op, PendingCommand,
};
pub use dispatch::{merge_json, CommandHandler, StatusSource};
pub use error::{LinkError, Result};
pub use frag::{
    FragmentPlan, Reassembler, ADAPTIVE_CHUNK_SIZE, ADAPTIVE_DELAY_MS, ADAPTIVE_THRESHOLD,
    CHUNK_SIZE, FRAGMENT_DELAY_MS, MAX_RESPONSE_SIZE_BYTES,
};
pub use metrics::{HealthLabel, LinkMetrics, MetricsReport, Trend, TrendReport, WindowStats};
pub use mtu::{MtuAction, MtuNegotiator, MtuState, MTU_ACCEPT_MAX, MTU_FALLBACK, MTU_REQUEST};
pub use stream::StreamWorker;
pub use transport::{
    ConfigTransport, LinkEvent, LinkTransport, MemoryClient, MemoryLink, TcpLink,
    INBOUND_QUEUE_DEPTH,
};
