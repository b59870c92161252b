//! Bounded-concurrency embedding of chunk texts.
//!
//! [`EmbeddingRunner`] fans a list of texts out to an [`EmbeddingProvider`]
//! with at most `max_concurrency` calls in flight. Outputs keep input order
//! and every input gets exactly one outcome: a vector or the error message of
//! its failed call. A failing item never fails its neighbours.
//!
//! Cancellation is observed through a [`CancellationToken`]. Once it fires no
//! new calls are issued, in-flight calls are dropped, and [`run`] resolves
//! with [`Cancelled`].
//!
//! [`run`]: EmbeddingRunner::run

use crate::config::EmbedConfig;
use crate::provider::EmbeddingProvider;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-item result: a vector, or the reason this item failed.
pub type EmbeddingOutcome = std::result::Result<Vec<f32>, String>;

/// The run was cancelled before every item resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("embedding run cancelled")]
pub struct Cancelled;

/// Runs embedding calls for many texts under a concurrency cap.
#[derive(Clone)]
pub struct EmbeddingRunner {
    provider: Arc<dyn EmbeddingProvider>,
    max_concurrency: usize,
}

impl std::fmt::Debug for EmbeddingRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingRunner")
            .field("provider", &self.provider.provider_name())
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

impl EmbeddingRunner {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, max_concurrency: usize) -> Self {
        Self {
            provider,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Runner whose cap comes from [`EmbedConfig::effective_concurrency`].
    pub fn from_config(provider: Arc<dyn EmbeddingProvider>, config: &EmbedConfig) -> Self {
        let runner = Self::new(provider, config.effective_concurrency());
        info!(
            "Embedding runner for {} using {} concurrent tasks",
            config.model_name, runner.max_concurrency
        );
        runner
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Embed every text, returning one outcome per input in input order.
    pub async fn run(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<EmbeddingOutcome>, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Embedding {} texts with concurrency {}",
            texts.len(),
            self.max_concurrency
        );

        let provider = &self.provider;
        let expected = provider.embedding_dimension();

        let outcomes = stream::iter(texts.iter().enumerate())
            .map(|(index, text)| async move {
                if cancel.is_cancelled() {
                    return Err("cancelled".to_string());
                }
                match provider.embed_text(text).await {
                    Ok(vector) if expected != 0 && vector.len() != expected => Err(format!(
                        "embedding dimension mismatch: expected {expected}, got {}",
                        vector.len()
                    )),
                    Ok(vector) => Ok(vector),
                    Err(e) => {
                        debug!("Embedding item {} failed: {}", index, e);
                        Err(e.to_string())
                    }
                }
            })
            .buffered(self.max_concurrency)
            .collect::<Vec<_>>();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            outcomes = outcomes => {
                if cancel.is_cancelled() {
                    Err(Cancelled)
                } else {
                    Ok(outcomes)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EmbedError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Returns `[len, first byte]`, fails on texts containing "boom",
    /// sleeps `delay_ms` parsed from a "sleep:N" prefix.
    struct ScriptedProvider {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = text
                .strip_prefix("sleep:")
                .and_then(|rest| rest.split(':').next())
                .and_then(|ms| ms.parse::<u64>().ok())
                .unwrap_or(5);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if text.contains("boom") {
                return Err(EmbedError::invalid_config("boom"));
            }
            Ok(vec![text.len() as f32, text.as_bytes()[0] as f32])
        }

        fn embedding_dimension(&self) -> usize {
            2
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_preserves_input_order() {
        let provider = Arc::new(ScriptedProvider::new());
        let runner = EmbeddingRunner::new(provider.clone(), 3);
        let input = texts(&["sleep:60:a", "sleep:1:bb", "sleep:30:ccc"]);

        let outcomes = runner.run(&input, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcomes.len(), 3);
        for (outcome, text) in outcomes.iter().zip(input.iter()) {
            assert_eq!(outcome.as_ref().unwrap()[0], text.len() as f32);
        }
    }

    #[tokio::test]
    async fn test_respects_concurrency_cap() {
        let provider = Arc::new(ScriptedProvider::new());
        let runner = EmbeddingRunner::new(provider.clone(), 2);
        let input: Vec<String> = (0..8).map(|i| format!("sleep:20:{i}")).collect();

        let outcomes = runner.run(&input, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcomes.len(), 8);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 8);
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_item_failure_is_reported_in_place() {
        let provider = Arc::new(ScriptedProvider::new());
        let runner = EmbeddingRunner::new(provider, 4);

        let outcomes = runner
            .run(&texts(&["ok", "boom", "fine"]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].as_ref().unwrap_err().contains("boom"));
        assert!(outcomes[2].is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_issues_no_calls() {
        let provider = Arc::new(ScriptedProvider::new());
        let runner = EmbeddingRunner::new(provider.clone(), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner.run(&texts(&["a", "b"]), &cancel).await;

        assert_eq!(result.unwrap_err(), Cancelled);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_resolves_promptly() {
        let provider = Arc::new(ScriptedProvider::new());
        let runner = EmbeddingRunner::new(provider.clone(), 1);
        let input: Vec<String> = (0..20).map(|i| format!("sleep:500:{i}")).collect();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = runner.run(&input, &cancel).await;

        assert_eq!(result.unwrap_err(), Cancelled);
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(provider.calls.load(Ordering::SeqCst) < 20);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let runner = EmbeddingRunner::new(Arc::new(ScriptedProvider::new()), 0);
        assert_eq!(runner.max_concurrency(), 1);
        let outcomes = runner.run(&[], &CancellationToken::new()).await.unwrap();
        assert!(outcomes.is_empty());
    }
}
