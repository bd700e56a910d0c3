pub mod bridge;
pub mod handoff;
pub mod ingress;
pub mod request;
pub mod scheduler;
pub mod server;
pub mod worker;

pub const DEFAULT_LISTEN_PORT: u16 = 7678;
pub const DEFAULT_JUNCTION_PORT: u16 = 5864;
pub const DEFAULT_PUMP_DEADLINE_SECS: u64 = 600;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 2;
pub const READ_CHUNK_BYTES: usize = 64 * 1024;
pub const SCHEDULER_TICK_MS: u64 = 250;
pub const PUMP_TICK_MS: u64 = 250;
pub const COMPLETION_CHANNEL_DEPTH: usize = 64;

/// Exact error text carried by bridges that outlive the pump deadline.
pub const PUMP_DEADLINE_ERROR: &str = "Exceeded 10 minute timeout.";

pub use bridge::Bridge;
pub use handoff::Handoff;
pub use request::ParsedRequest;
pub use server::{Engine, EngineHandle};
