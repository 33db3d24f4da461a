//! Tinpot — broker-mediated action dispatch plane.
//!
//! A coordinator exposes an HTTP/SSE façade; workers announce Lua actions
//! over MQTT and execute them on demand. Coordinator and workers never talk
//! directly: all coordination flows through the broker via retained
//! announcements and per-execution rendezvous topics.

// Library modules
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod protocol;
pub mod worker;

// Re-export commonly used types
pub use broker::{BrokerClient, QoS};
pub use config::Config;
pub use coordinator::catalog::ActionCatalog;
pub use coordinator::executions::{ExecutionRegistry, ExecutionState};
pub use protocol::{
    ActionAnnouncement, ExecStatus, ExecutionRequest, LogEntry, LogLevel, ResultResponse,
    StreamEvent,
};
pub use worker::manager::{ActionInfo, ActionManager};
