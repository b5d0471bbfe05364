//! Bid admission: per-platform dispatch pipeline, connectors, sinks and configuration.

#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod engine;
pub mod pipeline;
pub mod sinks;

pub use config::{EngineConfig, LoadError, PlatformSettings};
pub use connector::{
    AttemptContext, Connector, ConnectorSpec, ConnectorStatus, PlatformAck, ScriptedConnector,
    SimulatedConnector, SimulatedSettings, Step, StepOutcome,
};
pub use engine::{engine_without_sinks, BidEngine};
pub use pipeline::{Dispatcher, DispatcherStats};
pub use sinks::{AuditSink, AuditWriter, ChannelAuditSink, MemoryAuditSink, NoopAuditSink};
