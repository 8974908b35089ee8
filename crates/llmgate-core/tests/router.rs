use std::time::Duration;

use llmgate_core::config::{ModelAlias, ProviderModel};
use llmgate_core::router::ModelRouter;

fn candidate(provider: &str, model: &str, priority: u32) -> ProviderModel {
    ProviderModel {
        provider: provider.to_string(),
        model: model.to_string(),
        priority,
    }
}

fn aliases() -> Vec<ModelAlias> {
    vec![ModelAlias {
        alias: "gpt-4".to_string(),
        providers: vec![
            candidate("gemini", "gemini-1.5-pro", 2),
            candidate("openai", "gpt-4", 1),
        ],
    }]
}

#[tokio::test]
async fn resolve_sorts_candidates_by_priority() {
    let router = ModelRouter::new(&aliases());
    let candidates = router.resolve("gpt-4").unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].provider, "openai");
    assert_eq!(candidates[1].provider, "gemini");
}

#[tokio::test]
async fn unaliased_model_splits_on_first_slash() {
    let router = ModelRouter::new(&[]);
    let candidates = router.resolve("openai/gpt-4o-mini").unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].provider, "openai");
    assert_eq!(candidates[0].model, "gpt-4o-mini");
    assert_eq!(candidates[0].priority, 0);

    // Only the first slash splits.
    let candidates = router.resolve("gemini/models/gemini-pro").unwrap();
    assert_eq!(candidates[0].provider, "gemini");
    assert_eq!(candidates[0].model, "models/gemini-pro");
}

#[tokio::test]
async fn unknown_model_is_an_error() {
    let router = ModelRouter::new(&[]);
    let err = router.resolve("nonsense").unwrap_err();
    assert_eq!(err.to_string(), "Unknown model: nonsense");
    assert!(router.resolve("/leading").is_err());
    assert!(router.resolve("trailing/").is_err());
}

#[tokio::test]
async fn select_prefers_available_candidates() {
    let router = ModelRouter::new(&aliases());
    let candidates = router.resolve("gpt-4").unwrap();

    let selected = router.select(&candidates).await.unwrap();
    assert_eq!(selected.provider, "openai");

    router.mark_failed("openai").await;
    let selected = router.select(&candidates).await.unwrap();
    assert_eq!(selected.provider, "gemini");
}

#[tokio::test]
async fn all_failed_returns_best_failed_candidate() {
    let router = ModelRouter::new(&aliases());
    let candidates = router.resolve("gpt-4").unwrap();
    router.mark_failed("openai").await;
    router.mark_failed("gemini").await;

    // Degrade gracefully: still attempt the best candidate.
    let selected = router.select(&candidates).await.unwrap();
    assert_eq!(selected.provider, "openai");
}

#[tokio::test]
async fn select_on_empty_candidates_is_none() {
    let router = ModelRouter::new(&[]);
    assert!(router.select(&[]).await.is_none());
}

#[tokio::test]
async fn next_provider_never_repeats_within_ttl() {
    let router = ModelRouter::new(&aliases());
    let next = router.next_provider("gpt-4", "openai").await.unwrap().unwrap();
    assert_eq!(next.provider, "gemini");
    let next = router.next_provider("gpt-4", "openai").await.unwrap().unwrap();
    assert_ne!(next.provider, "openai");
}

#[tokio::test(start_paused = true)]
async fn failures_expire_after_ttl() {
    let router = ModelRouter::with_failure_ttl(&aliases(), Duration::from_secs(60));
    let candidates = router.resolve("gpt-4").unwrap();

    router.mark_failed("openai").await;
    assert_eq!(router.select(&candidates).await.unwrap().provider, "gemini");
    assert_eq!(router.failed_providers().await, vec!["openai".to_string()]);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(router.select(&candidates).await.unwrap().provider, "openai");
    assert!(router.failed_providers().await.is_empty());
}
