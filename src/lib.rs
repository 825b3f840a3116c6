//! Keeps at most one long-lived message pipe open exactly while something
//! needs it: foreground activity, pending inbound events, or a disabled push
//! channel, gated on registration, websocket enablement and reachability.

pub mod config;
pub mod gating;
pub mod model;
pub mod network;
pub mod service;
pub mod supervisor;
pub mod transport;

pub use gating::PendingEvent;
pub use model::{Lifecycle, SupervisorStatus};
pub use network::NetworkId;
pub use service::RetrievalService;
pub use supervisor::CurrentPipe;
