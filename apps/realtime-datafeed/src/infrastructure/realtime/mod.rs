//! Realtime Streaming
//!
//! One multiplexed WebSocket carrying every bar and quote subscription.
//!
//! - [`messages`]: client and server frame types
//! - [`codec`]: JSON encoding and lenient decoding of frames
//! - [`reconnect`]: exponential backoff policy
//! - [`heartbeat`]: ping scheduling and pong timeout detection
//! - [`outbound`]: bounded priority queue for frames sent while closed
//! - [`connection`]: connection state machine
//! - [`resync`]: registry replay planning
//! - [`dispatcher`]: inbound frame routing
//! - [`engine`]: the task that owns the socket and ties the above together
//! - [`websocket`]: `tokio-tungstenite` connector

pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod heartbeat;
pub mod messages;
pub mod outbound;
pub mod reconnect;
pub mod resync;
pub mod websocket;

pub use codec::{CodecError, JsonCodec};
pub use connection::{ConnectionManager, OpenResync};
pub use dispatcher::{Directive, StreamDispatcher};
pub use engine::{EngineDiagnostics, EngineHandle, EngineSettings, EngineStopped, RealtimeEngine};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use messages::{ClientMessage, Priority, ServerMessage};
pub use outbound::{EnqueueOutcome, OutboundQueue};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use resync::{ResyncEngine, ResyncPlan, ResyncRequest, ResyncScope};
pub use websocket::WebSocketConnector;
