//! Dispatcher behavior against a fake classifier.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use imgtriage::classify::{ClassifyError, Decision, Provider};
use imgtriage::dispatch::{DispatchConfig, DispatchError, DispatchOutcome, Dispatcher, TaskState};
use tokio::sync::mpsc;

use super::support::{response, verdict_json, FakeClassifier, PathEncoder};

fn config(concurrency: usize, rpm: u32) -> DispatchConfig {
    DispatchConfig {
        concurrency,
        requests_per_minute: rpm,
        timeout: Duration::from_secs(5),
        max_attempts: 1,
        base_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        ..DispatchConfig::default()
    }
}

fn paths(n: usize) -> Vec<PathBuf> {
    (0..n).map(|i| PathBuf::from(format!("/photos/img_{i:03}.jpg"))).collect()
}

async fn run_collect(
    dispatcher: &Dispatcher,
    paths: Vec<PathBuf>,
) -> (imgtriage::dispatch::DispatchSummary, Vec<DispatchOutcome>) {
    let (tx, mut rx) = mpsc::channel(8);
    let consume = async move {
        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    };
    let (summary, outcomes) = tokio::join!(dispatcher.run(paths, tx), consume);
    (summary.unwrap(), outcomes)
}

#[tokio::test]
async fn test_every_path_gets_exactly_one_outcome() {
    let classifier = FakeClassifier::new(Provider::Openai, |payload, _| {
        if payload.ends_with("7.jpg") {
            Ok(response("I can't help with that."))
        } else {
            Ok(response(&verdict_json("keep", 0.9, 0.05, 0.05, "family")))
        }
    });
    let dispatcher = Dispatcher::new(Arc::new(classifier), config(3, 0))
        .with_encoder(Arc::new(PathEncoder));

    let mut input = paths(20);
    input.push(PathBuf::from("/photos/broken.heic"));
    // Duplicates collapse to one task.
    input.push(PathBuf::from("/photos/img_000.jpg"));

    let (summary, outcomes) = run_collect(&dispatcher, input).await;

    assert_eq!(summary.total, 21);
    assert_eq!(outcomes.len(), 21);
    let distinct: HashSet<_> = outcomes.iter().map(|o| o.path.clone()).collect();
    assert_eq!(distinct.len(), 21);

    // img_007 and img_017 answer with prose.
    assert_eq!(summary.succeeded, 18);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.cancelled, 0);

    let broken = outcomes
        .iter()
        .find(|o| o.path.ends_with("broken.heic"))
        .unwrap();
    assert!(matches!(
        broken.state,
        TaskState::Failed(ClassifyError::LocalEncoding { .. })
    ));
    assert!(broken.cacheable_verdict().unwrap().is_sentinel());

    let good = outcomes
        .iter()
        .find(|o| o.path.ends_with("img_001.jpg"))
        .unwrap();
    match &good.state {
        TaskState::Succeeded(verdict) => assert_eq!(verdict.decision, Decision::Keep),
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(summary.usage.total_tokens, 15 * 20);
}

#[tokio::test]
async fn test_concurrency_and_rate_are_bounded() {
    let classifier = Arc::new(
        FakeClassifier::deleting(Provider::Gemini).with_delay(Duration::from_millis(20)),
    );
    // 6000 rpm spaces starts 10ms apart.
    let dispatcher = Dispatcher::new(classifier.clone(), config(4, 6000))
        .with_encoder(Arc::new(PathEncoder));

    let (summary, outcomes) = run_collect(&dispatcher, paths(50)).await;

    assert_eq!(outcomes.len(), 50);
    assert_eq!(summary.succeeded, 50);
    assert_eq!(classifier.calls(), 50);
    assert!(classifier.max_in_flight() <= 4);

    let starts = classifier.starts();
    let span = *starts.last().unwrap() - starts[0];
    assert!(span >= Duration::from_millis(450), "starts spanned only {span:?}");
}

#[tokio::test]
async fn test_auth_failure_cancels_the_rest() {
    let classifier = Arc::new(FakeClassifier::new(Provider::Claude, |_, _| {
        Err(ClassifyError::ProviderAuth("401 invalid x-api-key".into()))
    }));
    let dispatcher = Dispatcher::new(classifier.clone(), config(1, 0))
        .with_encoder(Arc::new(PathEncoder));

    let (summary, outcomes) = run_collect(&dispatcher, paths(20)).await;

    assert_eq!(outcomes.len(), 20);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.cancelled, 19);
    assert_eq!(classifier.calls(), 1);
    assert!(summary.aborted.unwrap().contains("401"));
    assert!(outcomes.iter().all(|o| o.cacheable_verdict().is_none()));
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let classifier = Arc::new(FakeClassifier::new(Provider::Openai, |_, call| {
        if call < 2 {
            Err(ClassifyError::Transient("503 service unavailable".into()))
        } else {
            Ok(response(&verdict_json("unsure", 0.3, 0.5, 0.2, "landscape")))
        }
    }));
    let dispatcher = Dispatcher::new(
        classifier.clone(),
        DispatchConfig {
            max_attempts: 3,
            ..config(1, 0)
        },
    )
    .with_encoder(Arc::new(PathEncoder));

    let (summary, outcomes) = run_collect(&dispatcher, paths(1)).await;

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.retries, 2);
    assert_eq!(outcomes[0].retries, 2);
    assert_eq!(classifier.calls(), 3);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let classifier = Arc::new(FakeClassifier::new(Provider::Openai, |_, _| {
        Err(ClassifyError::Transient("429 too many requests".into()))
    }));
    let dispatcher = Dispatcher::new(
        classifier.clone(),
        DispatchConfig {
            max_attempts: 3,
            ..config(2, 0)
        },
    )
    .with_encoder(Arc::new(PathEncoder));

    let (summary, outcomes) = run_collect(&dispatcher, paths(2)).await;

    assert_eq!(summary.failed, 2);
    assert_eq!(classifier.calls(), 6);
    assert!(outcomes.iter().all(|o| o.retries == 2));
    // Exhausted transient failures are cached as sentinels.
    assert!(outcomes.iter().all(|o| o.cacheable_verdict().is_some()));
}

#[tokio::test]
async fn test_timeout_is_transient() {
    let classifier = Arc::new(
        FakeClassifier::deleting(Provider::Openai).with_delay(Duration::from_millis(500)),
    );
    let dispatcher = Dispatcher::new(
        classifier,
        DispatchConfig {
            timeout: Duration::from_millis(50),
            ..config(1, 0)
        },
    )
    .with_encoder(Arc::new(PathEncoder));

    let (summary, outcomes) = run_collect(&dispatcher, paths(1)).await;

    assert_eq!(summary.failed, 1);
    match &outcomes[0].state {
        TaskState::Failed(err) => {
            assert!(err.is_transient());
            assert!(err.to_string().contains("timed out"));
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_before_start_cancels_everything() {
    let classifier = Arc::new(FakeClassifier::deleting(Provider::Openai));
    let flag = Arc::new(AtomicBool::new(true));
    let dispatcher = Dispatcher::new(classifier.clone(), config(4, 0))
        .with_encoder(Arc::new(PathEncoder))
        .with_shutdown_flag(flag);

    let (summary, outcomes) = run_collect(&dispatcher, paths(5)).await;

    assert_eq!(outcomes.len(), 5);
    assert_eq!(summary.cancelled, 5);
    assert_eq!(summary.submitted, 0);
    assert_eq!(classifier.calls(), 0);
}

#[tokio::test]
async fn test_dropped_receiver_is_an_error() {
    let classifier = Arc::new(FakeClassifier::deleting(Provider::Openai));
    let dispatcher = Dispatcher::new(classifier, config(2, 0)).with_encoder(Arc::new(PathEncoder));

    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let result = dispatcher.run(paths(5), tx).await;

    assert!(matches!(result, Err(DispatchError::ReceiverClosed)));
}
