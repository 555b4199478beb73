//! Router scenarios: strategy selection, the fallback loop, accounting
//! invariants, and the streaming fallback gate.

use futures::StreamExt;
use llm_relay::config::{GenerationParams, ProviderConfig};
use llm_relay::providers::{create_provider, Provider, ProviderInfo, ProviderKind, TextStream};
use llm_relay::{ProviderError, Router, RouterError, RoutingStrategy};
use std::sync::Arc;

fn mock(name: &str, model: &str) -> Arc<dyn Provider> {
    create_provider(
        ProviderKind::Mock,
        ProviderConfig::new(name).with_model(model),
    )
    .unwrap()
}

fn router_with(strategy: RoutingStrategy, models: &[(&str, &str)]) -> Router {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut router = Router::new(strategy);
    for (name, model) in models {
        router.add_provider(mock(name, model)).unwrap();
    }
    router
}

#[tokio::test]
async fn round_robin_cycles_through_providers_in_order() {
    let router = router_with(
        RoutingStrategy::RoundRobin,
        &[
            ("p1", "mock-normal"),
            ("p2", "mock-normal"),
            ("p3", "mock-normal"),
        ],
    );

    let expected_order = ["p1", "p2", "p3", "p1"];
    let mut expected_successes = std::collections::HashMap::new();
    for (i, prompt) in ["Q1", "Q2", "Q3", "Q4"].iter().enumerate() {
        let answer = router.route(prompt, None).await.unwrap();
        assert_eq!(answer, format!("Mock response to: {prompt}"));

        *expected_successes.entry(expected_order[i]).or_insert(0u64) += 1;
        let metrics = router.get_metrics();
        assert_eq!(
            metrics[expected_order[i]].success,
            expected_successes[expected_order[i]],
            "call {} should have landed on {}",
            i + 1,
            expected_order[i]
        );
    }

    let metrics = router.get_metrics();
    assert_eq!(metrics["p1"].success, 2);
    assert_eq!(metrics["p2"].success, 1);
    assert_eq!(metrics["p3"].success, 1);
}

#[tokio::test]
async fn round_robin_is_fair_over_many_calls() {
    let router = router_with(
        RoutingStrategy::RoundRobin,
        &[
            ("p1", "mock-normal"),
            ("p2", "mock-normal"),
            ("p3", "mock-normal"),
        ],
    );
    for i in 0..10 {
        router.route(&format!("q{i}"), None).await.unwrap();
    }
    let metrics = router.get_metrics();
    let mut counts: Vec<u64> = ["p1", "p2", "p3"].iter().map(|p| metrics[*p].success).collect();
    counts.sort_unstable();
    // 10 calls over 3 providers: each selected floor(10/3) or ceil(10/3) times.
    assert_eq!(counts, vec![3, 3, 4]);
}

#[tokio::test]
async fn concurrent_round_robin_calls_get_distinct_indices() {
    let router = Arc::new(router_with(
        RoutingStrategy::RoundRobin,
        &[("p1", "mock-normal"), ("p2", "mock-normal")],
    ));
    let a = tokio::spawn({
        let router = router.clone();
        async move { router.route("one", None).await }
    });
    let b = tokio::spawn({
        let router = router.clone();
        async move { router.route("two", None).await }
    });
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let metrics = router.get_metrics();
    assert_eq!(metrics["p1"].success, 1);
    assert_eq!(metrics["p2"].success, 1);
}

#[tokio::test]
async fn failed_attempt_falls_back_to_next_provider() {
    let router = router_with(
        RoutingStrategy::RoundRobin,
        &[
            ("p1", "mock-timeout"),
            ("p2", "mock-normal"),
            ("p3", "mock-normal"),
        ],
    );
    let answer = router.route("Hi", None).await.unwrap();
    assert_eq!(answer, "Mock response to: Hi");

    let metrics = router.get_metrics();
    assert_eq!(metrics["p1"].failure, 1);
    assert_eq!(metrics["p1"].success, 0);
    assert_eq!(metrics["p2"].success, 1);
    assert_eq!(metrics["p3"].total, 0);
}

#[tokio::test]
async fn round_robin_advances_once_per_call_not_per_attempt() {
    let router = router_with(
        RoutingStrategy::RoundRobin,
        &[
            ("p1", "mock-timeout"),
            ("p2", "mock-normal"),
            ("p3", "mock-normal"),
        ],
    );
    // Call 1 starts at p1, falls back to p2. The cursor advanced once, so
    // call 2 starts at p2 and p3 is not reached by either call.
    router.route("a", None).await.unwrap();
    router.route("b", None).await.unwrap();

    let metrics = router.get_metrics();
    assert_eq!(metrics["p2"].success, 2);
    assert_eq!(metrics["p3"].total, 0);
}

#[tokio::test]
async fn first_available_skips_unhealthy_providers() {
    let router = router_with(
        RoutingStrategy::FirstAvailable,
        &[
            ("p1", "mock-unhealthy"),
            ("p2", "mock-unhealthy"),
            ("p3", "mock-normal"),
        ],
    );
    let answer = router.route("ping", None).await.unwrap();
    assert_eq!(answer, "Mock response to: ping");

    let metrics = router.get_metrics();
    assert_eq!(metrics["p1"].total, 0, "unhealthy providers are not invoked");
    assert_eq!(metrics["p2"].total, 0);
    assert_eq!(metrics["p3"].success, 1);
}

#[tokio::test]
async fn all_providers_failing_surfaces_last_error() {
    let router = router_with(
        RoutingStrategy::RoundRobin,
        &[
            ("p1", "mock-timeout"),
            ("p2", "mock-timeout"),
            ("p3", "mock-timeout"),
        ],
    );
    let err = router.route("hi", None).await.unwrap_err();
    assert!(matches!(
        err.provider_error(),
        Some(ProviderError::Timeout(_))
    ));

    let metrics = router.get_metrics();
    for p in ["p1", "p2", "p3"] {
        assert_eq!(metrics[p].failure, 1, "{p} counted exactly one failure");
        assert_eq!(metrics[p].total, 1);
    }
}

#[tokio::test]
async fn last_error_kind_reflects_final_attempt() {
    let router = router_with(
        RoutingStrategy::RoundRobin,
        &[("p1", "mock-timeout"), ("p2", "mock-auth-error")],
    );
    let err = router.route("hi", None).await.unwrap_err();
    assert!(matches!(
        err.provider_error(),
        Some(ProviderError::Authentication(_))
    ));
}

#[tokio::test]
async fn only_healthy_provider_serves_every_call() {
    for strategy in [
        RoutingStrategy::RoundRobin,
        RoutingStrategy::Random,
        RoutingStrategy::FirstAvailable,
        RoutingStrategy::BestAvailable,
    ] {
        let router = router_with(
            strategy,
            &[
                ("p1", "mock-ratelimit"),
                ("p2", "mock-invalid-request"),
                ("p3", "mock-normal"),
            ],
        );
        for i in 0..4 {
            let answer = router.route(&format!("q{i}"), None).await.unwrap();
            assert_eq!(answer, format!("Mock response to: q{i}"), "{strategy}");
        }
        assert_eq!(router.get_metrics()["p3"].success, 4, "{strategy}");
    }
}

#[tokio::test]
async fn counters_stay_consistent_under_mixed_outcomes() {
    let router = router_with(
        RoutingStrategy::RoundRobin,
        &[("p1", "mock-timeout"), ("p2", "mock-normal")],
    );
    for i in 0..6 {
        let _ = router.route(&format!("q{i}"), None).await;
    }
    for (name, snap) in router.get_metrics() {
        assert_eq!(snap.total, snap.success + snap.failure, "{name}");
        assert_eq!(snap.total_tokens, snap.prompt_tokens + snap.completion_tokens);
    }
}

#[tokio::test]
async fn best_available_stops_attempting_an_unhealthy_provider() {
    let router = router_with(
        RoutingStrategy::BestAvailable,
        &[("p1", "mock-timeout"), ("p2", "mock-normal")],
    );
    // While p1 has fewer than 5 attempts it stays optimistically healthy and
    // keeps winning ties by registration order; each call fails over to p2.
    for i in 0..5 {
        router.route(&format!("q{i}"), None).await.unwrap();
    }
    let p1_attempts = router.get_metrics()["p1"].total;
    assert_eq!(p1_attempts, 5);

    // Now p1's recent error rate is 1.0 (unhealthy): calls start at p2.
    for i in 0..3 {
        router.route(&format!("r{i}"), None).await.unwrap();
    }
    let metrics = router.get_metrics();
    assert_eq!(metrics["p1"].total, p1_attempts, "p1 no longer attempted");
    assert_eq!(metrics["p2"].success, 8);
}

#[tokio::test]
async fn random_strategy_always_resolves() {
    let router = router_with(
        RoutingStrategy::Random,
        &[("p1", "mock-normal"), ("p2", "mock-normal")],
    );
    for i in 0..5 {
        router.route(&format!("q{i}"), None).await.unwrap();
    }
    let metrics = router.get_metrics();
    assert_eq!(metrics["p1"].success + metrics["p2"].success, 5);
}

#[tokio::test]
async fn stream_falls_back_before_first_chunk() {
    let router = router_with(
        RoutingStrategy::RoundRobin,
        &[("p1", "mock-timeout"), ("p2", "mock-normal")],
    );
    let stream = router.route_stream("hello", None).await.unwrap();
    let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
    assert_eq!(chunks.concat(), "Mock response to: hello");

    let metrics = router.get_metrics();
    assert_eq!(metrics["p1"].failure, 1);
    assert_eq!(metrics["p2"].success, 1);
}

#[tokio::test]
async fn stream_accounts_completion_tokens_on_success() {
    let router = router_with(RoutingStrategy::RoundRobin, &[("p1", "mock-normal")]);
    let stream = router.route_stream("hello", None).await.unwrap();
    let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
    assert!(!chunks.is_empty());

    let snap = &router.get_metrics()["p1"];
    assert_eq!(snap.success, 1);
    // "hello" is one word, the response is four: the word-count fallback
    // gives round(1 * 1.3) = 1 and round(4 * 1.3) = 5.
    assert_eq!(snap.prompt_tokens, 1);
    assert_eq!(snap.completion_tokens, 5);
}

/// Yields one chunk, then fails. Used to pin the post-commitment gate.
struct PartialStreamProvider {
    name: String,
}

#[async_trait::async_trait]
impl Provider for PartialStreamProvider {
    fn describe(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            model: "partial".to_string(),
            kind: ProviderKind::Mock,
        }
    }

    async fn generate(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::Provider("unary path not under test".into()))
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<TextStream, ProviderError> {
        Ok(Box::pin(futures::stream::iter(vec![
            Ok("partial ".to_string()),
            Err(ProviderError::Provider("connection reset mid-stream".into())),
        ])))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn stream_error_after_first_chunk_does_not_fall_back() {
    let mut router = Router::new(RoutingStrategy::RoundRobin);
    router
        .add_provider(Arc::new(PartialStreamProvider {
            name: "pA".to_string(),
        }))
        .unwrap();
    router.add_provider(mock("pB", "mock-normal")).unwrap();

    let mut stream = router.route_stream("hi", None).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, "partial ");
    let second = stream.next().await.unwrap();
    assert!(matches!(second, Err(ProviderError::Provider(_))));
    assert!(stream.next().await.is_none());

    let metrics = router.get_metrics();
    assert_eq!(metrics["pA"].failure, 1);
    assert_eq!(metrics["pB"].total, 0, "no fallback after a chunk was emitted");
}

#[tokio::test]
async fn dropped_call_updates_no_counters() {
    let router = Arc::new(router_with(RoutingStrategy::RoundRobin, &[("p1", "mock-normal")]));
    let call = {
        let router = router.clone();
        tokio::spawn(async move { router.route("never finishes", None).await })
    };
    // The mock answers after ~100 ms; cancel well before that.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    call.abort();
    let _ = call.await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let snap = &router.get_metrics()["p1"];
    assert_eq!(snap.total, 0, "cancelled attempt is neither success nor failure");
}

#[tokio::test]
async fn route_reports_typed_error_for_unknown_strategy_name() {
    assert!(matches!(
        Router::from_strategy_name("least-used"),
        Err(RouterError::UnknownStrategy { .. })
    ));
}
