//! Hybrid optical-recognition pipeline.
//!
//! Two interchangeable recognition engines (a fast pattern matcher and an
//! accurate learned model) run over normalized document pages; a fusion
//! engine reconciles their disagreements into one best result; a priority
//! job queue orchestrates the asynchronous, retryable, cancellable work.

use clap::Parser;
use std::path::PathBuf;

pub mod catalog;
pub mod config;
pub mod engine;
pub mod engines;
pub mod error;
pub mod fusion;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod store;

#[derive(Parser, Debug)]
#[command(name = "hybrid-ocr-server")]
#[command(about = "Hybrid OCR pipeline server with dual-engine result fusion")]
#[command(version)]
pub struct Args {
    /// Host address to bind to
    #[arg(long, env = "OCR_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "OCR_PORT", default_value = "9292")]
    pub port: u16,

    /// Directory containing the documents served by the filesystem catalog
    #[arg(long, env = "OCR_DOCUMENTS_DIR", default_value = "./documents")]
    pub documents_dir: PathBuf,

    /// SQLite database path; omit to keep all state in memory
    #[arg(long, env = "OCR_DATABASE")]
    pub database: Option<PathBuf>,

    /// Days to keep terminal queue items and failed results
    #[arg(long, env = "OCR_RETENTION_DAYS", default_value = "90")]
    pub retention_days: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}
