//! # sextant-embed
//!
//! Text embeddings for the sextant code index. Embeddings are produced by
//! local ONNX models through FastEmbed, behind the [`EmbeddingProvider`] trait
//! so the retriever can treat the model as a black box mapping text to a
//! fixed-length vector.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sextant_embed::{EmbedConfig, EmbeddingRunner, FastEmbedProvider};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = EmbedConfig::default_with_path("/tmp/models");
//! let provider = Arc::new(FastEmbedProvider::create(config.clone()).await?);
//! let runner = EmbeddingRunner::from_config(provider, &config);
//!
//! let texts = vec!["fn main() {}".to_string(), "def main(): pass".to_string()];
//! let outcomes = runner.run(&texts, &CancellationToken::new()).await?;
//! for outcome in outcomes {
//!     match outcome {
//!         Ok(vector) => println!("{} dimensions", vector.len()),
//!         Err(message) => println!("failed: {message}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: model selection, context length, pooling, concurrency cap
//! - [`provider`]: the provider trait and the FastEmbed implementation
//! - [`runner`]: bounded-concurrency, cancellable, per-item fault tolerant embedding
//! - [`error`]: error types

pub mod config;
pub mod error;
pub mod provider;
pub mod runner;

pub use config::{EmbedConfig, PoolingStrategy, TokenizerConfig};
pub use error::{EmbedError, Result};
pub use provider::{EmbeddingProvider, EmbeddingResult, FastEmbedProvider};
pub use runner::{Cancelled, EmbeddingOutcome, EmbeddingRunner};
