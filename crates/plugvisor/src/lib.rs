//! # plugvisor
//!
//! Heartbeat supervision for helper processes. A `Supervisor` in the parent
//! pulses a `Monitor` that owns the child; when the pulses stop, for any
//! reason, the monitor kills the child and reports how it went.

pub mod config;
pub mod error;
pub mod monitor;
pub mod pulse;
pub mod sink;
pub mod supervisor;

pub use config::HeartbeatConfig;
pub use error::Error;
pub use error::Result;
pub use monitor::CommandSpec;
pub use monitor::Monitor;
pub use monitor::MonitorState;
pub use monitor::Report;
pub use monitor::StopReason;
pub use monitor::Teardown;
pub use pulse::LinePulseReader;
pub use pulse::LinePulseWriter;
pub use pulse::PulseSink;
pub use pulse::PulseSource;
pub use sink::LogSink;
pub use sink::MemorySink;
pub use sink::Source;
pub use sink::StdioSink;
pub use sink::TracingSink;
pub use supervisor::Supervisor;
