#![doc(html_root_url = "https://docs.rs/sipframe/latest")]
//! Transaction-aware proxy engine for a text-based signaling protocol.
//!
//! `sipframe` decodes requests on downstream connections, correlates them
//! into transactions keyed by their branch identifier, resolves an
//! upstream destination per routing policy (including sticky-session
//! affinity via an external assistant), and forwards traffic over pooled
//! per-host connections. Each worker partition owns its registry and
//! router exclusively; asynchronous collaborators complete through the
//! worker's event channel.

pub mod affinity;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod downstream;
pub mod error;
pub mod filter;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod reply;
pub mod router;
pub mod test_helpers;
pub mod transaction;
pub mod upstream;
pub mod worker;

pub use affinity::{AffinityCache, AffinityUpdate, StickyAssistant};
pub use cluster::{LoadBalancer, PickError};
pub use codec::{MessageDecoder, MessageEncoder, SignalingCodec, SignalingEncoder};
pub use config::{ProxySettings, RouteConfig, RouteEntryConfig};
pub use downstream::{CloseMode, DownstreamCommand, DownstreamHandle, DownstreamId};
pub use error::{PoolFailure, ProxyError, Result, RoutingFailure, UnsetField};
pub use filter::{Boundary, FilterChain, FilterContext, FilterStatus, MessageFilter};
pub use message::{EditOp, MessageMetadata, Method, MsgKind};
pub use registry::{Resolved, SweepStats, TransactionRegistry};
pub use reply::{LocalReply, ReplyClass};
pub use router::{RouteOutcome, RouteTable, Router};
pub use transaction::{ActiveTransaction, TransactionState};
pub use upstream::{ConnState, ConnectionPool, UpstreamConnection, UpstreamRequest};
pub use worker::{ProxyBuilder, ProxyWorker, WorkerEvent, WorkerHandle};
