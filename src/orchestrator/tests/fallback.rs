use super::*;
use crate::gateway::ProviderError;
use crate::ledger::RunOutcome;
use std::time::Duration;

fn unavailable() -> ProviderError {
    ProviderError::Api { status: 503, message: "service unavailable".into() }
}

#[tokio::test]
async fn retries_exhaust_primary_then_secondary_answers() {
    // Primary (medium) takes 503 x3 then a 429 with a retry-after hint;
    // the secondary (small) succeeds on its first call.
    let provider = Arc::new(
        MockPlatform::new(&maintenance_reply(0.9), "Falling back worked. ").with_stream_failures(
            vec![
                unavailable(),
                unavailable(),
                unavailable(),
                ProviderError::RateLimited {
                    message: "too many requests".into(),
                    retry_after: Some(Duration::from_millis(2)),
                },
            ],
        ),
    );
    let runtime = test_runtime(provider).await;

    let response = runtime
        .handle_query(
            query("How do I replace the landing gear actuator on a Boeing 737?", None),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(response.response.contains("worked"));

    runtime.ledger.flush().await;
    let runs = runtime.ledger.run_records(response.conversation_id);
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.outcome, RunOutcome::Ok);

    // Four failed attempts on medium, one successful attempt on small
    assert_eq!(run.attempts.len(), 5);
    let (medium, small): (Vec<_>, Vec<_>) =
        run.attempts.iter().partition(|a| a.tier == Tier::Medium);
    assert_eq!(medium.len(), 4);
    assert!(medium.iter().all(|a| !a.succeeded()));
    assert_eq!(small.len(), 1);
    assert!(small[0].succeeded());
    assert_eq!(run.tier, Some(Tier::Small));

    // The assistant message is attributed to the tier that answered
    let messages = runtime.store.read(response.conversation_id, None).await.unwrap();
    assert_eq!(messages[1].tier_used.as_deref(), Some("small"));
}

#[tokio::test]
async fn all_tiers_failing_surfaces_upstream_failed() {
    let provider = Arc::new(
        MockPlatform::new(&maintenance_reply(0.9), "never sent")
            .with_stream_failures(vec![unavailable(); 8]),
    );
    let runtime = test_runtime(provider).await;

    let conversation = runtime.store.create_conversation("tech-1", "Doomed").await.unwrap();
    let (_, mut rx) = subscribe(&runtime, conversation.id);

    let err = runtime
        .handle_query(
            query(
                "How do I replace the landing gear actuator on a Boeing 737?",
                Some(conversation.id),
            ),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "upstream_failed");

    // The user message stays; no assistant message was appended
    let messages = runtime.store.read(conversation.id, None).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, "user");

    // One attempt per provider call, across both chain tiers
    runtime.ledger.flush().await;
    let runs = runtime.ledger.run_records(conversation.id);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RunOutcome::Failed);
    assert_eq!(runs[0].error_kind.as_deref(), Some("upstream_failed"));
    assert_eq!(runs[0].attempts.len(), 8);
    assert!(runs[0].attempts.iter().any(|a| a.tier == Tier::Medium));
    assert!(runs[0].attempts.iter().any(|a| a.tier == Tier::Small));

    // Subscribers observed an error event
    let kinds = drain_kinds(&mut rx);
    assert!(kinds.contains(&"error".to_string()));
    assert!(!kinds.contains(&"assistant_message".to_string()));
}

#[tokio::test]
async fn premature_stream_close_fails_without_persisting() {
    // The stream opens and delivers deltas, then closes with no finish
    // reason: the partial text must not be stored as a complete answer.
    let provider = Arc::new(
        MockPlatform::new(&maintenance_reply(0.9), "a partial answer that was cut ")
            .ending_without_finish(),
    );
    let runtime = test_runtime(provider).await;

    let conversation = runtime.store.create_conversation("tech-1", "Cut off").await.unwrap();
    let (_, mut rx) = subscribe(&runtime, conversation.id);

    let err = runtime
        .handle_query(query("long question", Some(conversation.id)), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "upstream_failed");

    // Only the user message survives
    let messages = runtime.store.read(conversation.id, None).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, "user");

    runtime.ledger.flush().await;
    let runs = runtime.ledger.run_records(conversation.id);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RunOutcome::Failed);
    let attempt = runs[0].attempts.last().expect("broken attempt recorded");
    assert!(!attempt.succeeded());
    assert!(attempt.error.as_deref().unwrap().contains("finish"));

    // Streaming started, then the failure was published
    let kinds = drain_kinds(&mut rx);
    assert!(kinds.contains(&"typing_start".to_string()));
    assert!(kinds.contains(&"error".to_string()));
    assert!(!kinds.contains(&"assistant_message".to_string()));
}

#[tokio::test]
async fn content_policy_refusal_is_not_retried() {
    let provider = Arc::new(
        MockPlatform::new(&maintenance_reply(0.9), "never sent").with_stream_failures(vec![
            ProviderError::ContentPolicy("request refused".into()),
        ]),
    );
    let runtime = test_runtime(provider).await;

    let err = runtime
        .handle_query(query("do something disallowed", None), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "upstream_policy");

    runtime.ledger.flush().await;
    let conversations = runtime.store.list_conversations("tech-1").await.unwrap();
    let runs = runtime.ledger.run_records(conversations[0].id);
    assert_eq!(runs[0].attempts.len(), 1, "policy refusals are terminal");
}

#[tokio::test]
async fn saturated_gateway_turns_requests_away_unpersisted() {
    let provider = Arc::new(MockPlatform::new(&maintenance_reply(0.9), "x"));
    let mut config = test_config();
    config.gateway.concurrency_per_tier = 1;
    config.gateway.admit_timeout_secs = 0;
    let runtime = runtime_with(provider, config).await;

    // Hold the single small-tier slot so the admission probe times out
    let _slot = runtime.gateway.admit(Tier::Small).await.unwrap();

    let err = runtime
        .handle_query(query("is anyone there", None), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "overloaded");
    assert!(
        runtime.store.list_conversations("tech-1").await.unwrap().is_empty(),
        "overloaded requests leave no trace"
    );
}

#[tokio::test]
async fn second_query_on_locked_conversation_is_busy() {
    let provider = Arc::new(
        MockPlatform::new(&maintenance_reply(0.9), "first answer that keeps streaming")
            .hanging_after(1),
    );
    let mut config = test_config();
    config.gateway.lock_timeout_secs = 0;
    let runtime = runtime_with(provider, config).await;

    let conversation = runtime.store.create_conversation("tech-1", "Contended").await.unwrap();
    let cancel = CancellationToken::new();

    let first = {
        let runtime = Arc::clone(&runtime);
        let conversation_id = conversation.id;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            runtime
                .handle_query(query("long question", Some(conversation_id)), cancel)
                .await
        })
    };

    // Give the first run time to take the lock and start streaming
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = runtime
        .handle_query(query("second question", Some(conversation.id)), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "busy");

    cancel.cancel();
    let result = first.await.unwrap();
    assert_eq!(result.unwrap_err().kind(), "cancelled");
}
