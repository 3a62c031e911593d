//! Bridge Transport
//!
//! Request/response messaging between UI contexts and the single background
//! context over the host's best-effort primitive:
//!
//! - `host`: the messaging primitive (`Port`, `LocalHost`)
//! - `client`: retrying request client with connection status
//! - `protocol`: reserved keys answered by the runtime
//! - `remote_store`: UI-side view of a central store

pub mod client;
pub mod host;
pub mod protocol;
pub mod remote_store;

pub use client::BridgeClient;
pub use host::{BackgroundPort, Inbound, LocalHost, Port, PortError, UiConnection, UiPort};
pub use remote_store::RemoteStore;
