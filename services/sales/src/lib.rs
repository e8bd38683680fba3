//! Bromato Sales Service
//!
//! Tracks marketplace sales of the Bad Bromatoes NFT collection, stores each
//! sale exactly once, and publishes unpublished sales to a social channel one
//! at a time, oldest first.
//!
//! ## Features
//!
//! - **Cursor-based ingestion**: walks a paginated activity feed (Solana RPC
//!   signatures or the Alpha Art activity API) newest-first and stops at the
//!   first sale already stored
//! - **Bounded retries**: every remote call runs under a retry policy with a
//!   fixed backoff and an overall deadline
//! - **Resumable publication**: the uploaded media handle is cached on the
//!   record so a failed post never re-uploads
//! - **Operational API**: health, readiness and record lookups over HTTP
//!
//! ## Architecture
//!
//! ```text
//! Activity feed              PostgreSQL                 Social channel
//! ┌──────────────┐          ┌──────────────┐           ┌──────────────┐
//! │ Solana RPC / │          │ sales        │           │ media upload │
//! │ Alpha Art    │          │  (id, doc)   │           │ post         │
//! └──────────────┘          └──────────────┘           └──────────────┘
//!        │                     ▲        │                     ▲
//!        ▼                     │        ▼                     │
//! ┌──────────────┐             │  ┌──────────────┐     ┌──────────────┐
//! │ Ingestion    │─────────────┘  │ Publisher    │────▶│ Media        │
//! │ Engine       │                │              │     │ Resolver     │
//! └──────────────┘                └──────────────┘     └──────────────┘
//! ```

pub mod api;
pub mod channel;
pub mod config;
pub mod ingest;
pub mod marketplace;
pub mod media;
pub mod price;
pub mod publish;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod store;

pub use config::Config;
pub use ingest::{IngestReport, IngestSettings, IngestionEngine};
pub use publish::{MessageTemplate, PublishOutcome, PublishSettings, Publisher};
pub use record::SaleRecord;
pub use store::{PostgresStore, RecordStore};
