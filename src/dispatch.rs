//! Route a message and bring its target model up
//!
//! A failed or skipped swap always leaves the caller on its current model.

use crate::lifecycle::{ModelLifecycleManager, ModelState};
use crate::metrics;
use crate::router::{IntentRouter, RoutingContext, RoutingResult};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub routing: RoutingResult,
    /// Model that should serve the message
    pub model_slug: String,
    pub swapped: bool,
}

pub struct ModelDispatcher {
    router: Arc<IntentRouter>,
    lifecycle: Arc<ModelLifecycleManager>,
    swap_in_progress: AtomicBool,
}

impl ModelDispatcher {
    pub fn new(router: Arc<IntentRouter>, lifecycle: Arc<ModelLifecycleManager>) -> Self {
        Self {
            router,
            lifecycle,
            swap_in_progress: AtomicBool::new(false),
        }
    }

    pub fn router(&self) -> &IntentRouter {
        &self.router
    }

    pub fn is_swapping(&self) -> bool {
        self.swap_in_progress.load(Ordering::SeqCst)
    }

    pub async fn route_and_load(
        &self,
        message: &str,
        current_slug: &str,
        has_document_corpus: bool,
    ) -> RouteDecision {
        let routing = self.router.route(
            message,
            &RoutingContext {
                current_model_slug: current_slug.to_string(),
                has_document_corpus,
            },
        );

        let preview: String = message.chars().take(40).collect();
        tracing::info!(
            message = %preview,
            intent = %routing.intent,
            target = %routing.target_model_slug,
            confidence = routing.confidence,
            reason = %routing.reason,
            "Routed message"
        );
        metrics::record_route(&routing.intent.to_string(), &routing.target_model_slug);

        let stay = |routing: RoutingResult| RouteDecision {
            routing,
            model_slug: current_slug.to_string(),
            swapped: false,
        };

        if routing.target_model_slug == current_slug {
            return stay(routing);
        }

        if self
            .swap_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(
                target = %routing.target_model_slug,
                "Swap already in progress, staying on current model"
            );
            return stay(routing);
        }

        let _guard = SwapGuard {
            flag: &self.swap_in_progress,
        };

        let target = routing.target_model_slug.clone();
        if self.lifecycle.model_state(&target).await == ModelState::Ready {
            return RouteDecision {
                routing,
                model_slug: target,
                swapped: true,
            };
        }

        match self.lifecycle.ensure(&target).await {
            Ok(_) => RouteDecision {
                routing,
                model_slug: target,
                swapped: true,
            },
            Err(e) => {
                tracing::warn!(
                    target = %target,
                    current = %current_slug,
                    error = %e,
                    "Failed to load routed model, staying on current model"
                );
                stay(routing)
            }
        }
    }
}

/// Clears the swap flag however the swap ends
struct SwapGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SwapGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::mocks::MockArtifactSource;
    use crate::catalog::Catalog;
    use crate::device::FixedMemoryProbe;
    use crate::router::{Intent, RouterConfig};
    use std::time::Duration;

    const GB: u64 = 1024 * 1024 * 1024;

    fn dispatcher(source: Arc<MockArtifactSource>) -> (Arc<ModelDispatcher>, Arc<ModelLifecycleManager>) {
        let catalog = Arc::new(Catalog::default());
        let lifecycle = Arc::new(ModelLifecycleManager::new(
            catalog.clone(),
            Arc::new(FixedMemoryProbe(12 * GB)),
            source,
        ));
        let router = Arc::new(IntentRouter::new(&catalog, RouterConfig::default()));
        (
            Arc::new(ModelDispatcher::new(router, lifecycle.clone())),
            lifecycle,
        )
    }

    #[tokio::test]
    async fn test_same_target_no_swap() {
        let source = Arc::new(MockArtifactSource::new());
        let (dispatcher, _) = dispatcher(source.clone());

        let decision = dispatcher.route_and_load("Hi", "lfm2-350m", false).await;
        assert!(!decision.swapped);
        assert_eq!(decision.model_slug, "lfm2-350m");
        assert_eq!(source.resolve_count("lfm2-350m"), 0);
    }

    #[tokio::test]
    async fn test_swap_loads_target() {
        let source = Arc::new(MockArtifactSource::new());
        let (dispatcher, lifecycle) = dispatcher(source.clone());

        let decision = dispatcher
            .route_and_load("Turn on the flashlight", "lfm2-350m", false)
            .await;
        assert_eq!(decision.routing.intent, Intent::Action);
        assert!(decision.swapped);
        assert_eq!(decision.model_slug, "lfm2-1.2b");
        assert_eq!(lifecycle.model_state("lfm2-1.2b").await, ModelState::Ready);

        // Already ready: swapped without another load
        let again = dispatcher
            .route_and_load("Set a timer", "lfm2-350m", false)
            .await;
        assert!(again.swapped);
        assert_eq!(source.resolve_count("lfm2-1.2b"), 1);
        assert!(!dispatcher.is_swapping());
    }

    #[tokio::test]
    async fn test_failed_swap_keeps_current_model() {
        let source = Arc::new(MockArtifactSource::new());
        source.fail("lfm2-1.2b");
        let (dispatcher, _) = dispatcher(source);

        let decision = dispatcher
            .route_and_load("Open settings", "lfm2-700m", false)
            .await;
        assert!(!decision.swapped);
        assert_eq!(decision.model_slug, "lfm2-700m");
        assert_eq!(decision.routing.target_model_slug, "lfm2-1.2b");
        assert!(!dispatcher.is_swapping());
    }

    #[tokio::test]
    async fn test_busy_dispatcher_does_not_start_second_swap() {
        let source = Arc::new(MockArtifactSource::new().with_delay(Duration::from_millis(50)));
        let (dispatcher, _) = dispatcher(source.clone());

        let first = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .route_and_load("Turn on wifi", "lfm2-350m", false)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(dispatcher.is_swapping());

        let second = dispatcher
            .route_and_load("Hello there", "lfm2-700m", false)
            .await;
        assert!(!second.swapped);
        assert_eq!(second.model_slug, "lfm2-700m");
        assert_eq!(source.resolve_count("lfm2-350m"), 0);

        let first = first.await.unwrap();
        assert!(first.swapped);
    }
}
