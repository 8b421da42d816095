//! creatorlink worker - concrete job kinds and the processing-service client.
//!
//! ```text
//!   QueueDispatcher.enqueue ──► NATS JetStream (work queue)
//!                                        │ pull
//!                                        ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ Worker (creatorlink::dispatcher)                     │
//! │  - claim the job record (queued → processing)        │
//! │  - run the handler for its kind under a timeout      │
//! │  - write the outcome, ack or retry with backoff      │
//! └──────────────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//!   AccountStore + registry   ProcessorClient (HTTP)
//!   (fresh platform tokens)   transcript / ingest / repost
//! ```
//!
//! # Job kinds
//!
//! - [`handlers::TranscriptHandler`] - `transcript`
//! - [`handlers::AutoIngestHandler`] - `auto_ingest`
//! - [`handlers::RepostPackageHandler`] - `repost_package`

pub mod handlers;
pub mod processor;

pub use handlers::registry;
pub use processor::ProcessorClient;
