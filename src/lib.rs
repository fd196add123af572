//! # rustsyntheca
//!
//! Research-output harvesting and reconciliation pipeline.
//!
//! ## Modules
//!
//! - [`harvester`] - Resumable OAI-PMH harvesting over date windows
//! - [`oai`] - OAI-PMH page parsing and CERIF flattening
//! - [`openalex`] - OpenAlex works by id / by title
//! - [`merge`] - Three-pass matching with provenance
//! - [`dedup`] - Exact-key deduplication
//! - [`cache`] - Columnar on-disk cache
//! - [`client`] - Retrying HTTP client
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rustsyntheca::{config::Settings, pipeline::Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::from_env()?;
//!     let pipeline = Pipeline::new(&settings)?;
//!     let output = pipeline.run(&[]).await;
//!     println!("{}", output.summary);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod corrections;
pub mod dedup;
pub mod error;
pub mod harvester;
pub mod matching;
pub mod merge;
pub mod normalize;
pub mod oai;
pub mod openalex;
pub mod pipeline;
pub mod progress;
pub mod record;

pub use error::{Result, SynthecaError};
pub use record::{FieldAccess, Record, Value};
