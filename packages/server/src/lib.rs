//! Ragline core library.
//!
//! Document ingestion with a two-stage chunk→embed pipeline per file,
//! durable progress records in Postgres, and live progress updates over
//! WebSockets. The chunking and embedding algorithms are external
//! collaborators behind the `kernel::workflow::stages` traits.

pub mod config;
pub mod kernel;
pub mod server;

pub use config::Config;
