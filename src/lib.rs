// Identity normalization (handles, profile URLs, display names)
pub mod identity;

// Injected configuration
pub mod config;

// OAuth connectors and the platform registry
pub mod connectors;

// Encrypted storage for connected accounts
pub mod accounts;

// Job records, state machine and retry policy
pub mod jobs;

// Job repository (source of truth for job state)
pub mod store;

// Durable job queue
pub mod queue;

// Enqueue + worker loop
pub mod dispatcher;

pub use connectors::{
    ConnectorCallbackPayload, ConnectorError, ConnectorProfile, ConnectorProvider,
    ConnectorRegistry, ConnectorStartResult, UserContext,
};
pub use dispatcher::{HandlerRegistry, JobHandler, QueueDispatcher, Worker};
pub use jobs::{ErrorClass, JobContext, JobError, JobKind, JobRecord, JobStatus, RetryPolicy};
