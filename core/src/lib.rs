pub mod config;
pub mod contract;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod host;
pub mod ids;
pub mod intent;
pub mod intent_router;
pub mod node;
pub mod orchestrator;
pub mod reducer;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use config::HostConfig;
pub use contract::lockfile::ProtocolLockfile;
pub use contract::{ContractStore, NodeKind, NodeMetadata};
pub use envelope::{Envelope, NodeInput};
pub use error::{HostError, Result};
pub use handler::{Handler, HandlerRegistry};
pub use host::{HealthReport, HostBuilder, LifecycleState, RuntimeHost};
pub use intent::{Intent, IntentType};
pub use router::{DispatchReport, EnvelopeRouter, RoutingSummary};
pub use transport::{EventSource, InMemoryEventSource};
