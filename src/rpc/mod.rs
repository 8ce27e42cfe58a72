//! The streaming-RPC subscription engine (spec.md §4.5) — WS binary
//! frames carrying a length-prefixed JSON payload (see DESIGN.md's "RPC
//! framing transport choice").

pub mod framing;
pub mod service;
pub mod subscriber;
pub mod ws;

pub use service::{NoopDispatcher, RpcService, SessionDispatcher, SubscribeRequest, SubscriptionHandle, WorkflowVerb};
