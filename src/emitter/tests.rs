use super::*;
use crate::config::MiddlewareConfig;
use crate::message::MessageKind;
use crate::output::{MockTrafficSink, Overflow, WriteOutcome};
use crate::test_utils::{
    requests, FixedOutcomeSink, RecordingSink, SourceTail, StalledSink, VecSource,
};
use std::time::Duration;

fn fast_config() -> EmitterConfig {
    EmitterConfig {
        shutdown_grace_ms: 200,
        lane_capacity: 1000,
        retry_backoff_ms: 1,
        retry_backoff_max_ms: 5,
    }
}

fn shell_middleware(script: &str, on_failure: FailurePolicy) -> MiddlewareConfig {
    let mut config = MiddlewareConfig::new("sh");
    config.args = vec!["-c".into(), script.into()];
    config.on_failure = on_failure;
    config.stop_timeout_ms = 500;
    config
}

#[tokio::test]
async fn test_per_source_order_is_preserved() {
    let messages = requests(200);
    let (sink, written) = RecordingSink::new("recording");
    let plugins = Plugins::new()
        .with_source(VecSource::new("vec", messages.clone(), SourceTail::End))
        .with_sink(sink);

    let emitter = Emitter::new(fast_config());
    let reason = emitter.start(plugins).await.unwrap();

    assert_eq!(reason, StopReason::SourcesExhausted);
    assert_eq!(*written.lock().unwrap(), messages);
}

#[tokio::test]
async fn test_concurrent_writes_start_in_arrival_order() {
    let messages = requests(50);
    let (sink, written) = RecordingSink::new("recording");
    let sink = sink.with_max_in_flight(8);
    let plugins = Plugins::new()
        .with_source(VecSource::new("vec", messages.clone(), SourceTail::End))
        .with_sink(sink);

    Emitter::new(fast_config()).start(plugins).await.unwrap();

    // Without a delay each write completes in the order it was started.
    assert_eq!(*written.lock().unwrap(), messages);
}

#[tokio::test]
async fn test_stalled_sink_does_not_block_fast_sink() {
    let messages = requests(20);
    let (fast, written) = RecordingSink::new("fast");
    let plugins = Plugins::new()
        .with_source(
            VecSource::new("vec", messages.clone(), SourceTail::End)
                .with_interval(Duration::from_millis(1)),
        )
        .with_sink(StalledSink)
        .with_sink(fast);

    let mut config = fast_config();
    config.lane_capacity = 4;
    let emitter = Emitter::new(config);
    let mut reports = emitter.subscribe();

    let reason = tokio::time::timeout(Duration::from_secs(5), emitter.start(plugins))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, StopReason::SourcesExhausted);
    assert_eq!(*written.lock().unwrap(), messages);

    let mut lane_full = 0;
    while let Ok(report) = reports.try_recv() {
        if report.sink == "stalled" && report.outcome == WriteOutcome::Dropped("lane full".into()) {
            lane_full += 1;
        }
    }
    // One write in flight plus a full lane; the rest overflowed.
    assert_eq!(lane_full, 20 - 1 - 4);
}

#[tokio::test]
async fn test_full_lane_holds_the_producer_for_waiting_sinks() {
    let messages = requests(300);
    let (sink, written) = RecordingSink::new("slow");
    let sink = sink.with_delay(Duration::from_millis(1));
    let plugins = Plugins::new()
        .with_source(VecSource::new("vec", messages.clone(), SourceTail::End))
        .with_sink(sink);

    let mut config = fast_config();
    config.lane_capacity = 2;
    config.shutdown_grace_ms = 5_000;
    let emitter = Emitter::new(config);
    let mut reports = emitter.subscribe();

    let reason = tokio::time::timeout(Duration::from_secs(10), emitter.start(plugins))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, StopReason::SourcesExhausted);
    assert_eq!(*written.lock().unwrap(), messages);
    while let Ok(report) = reports.try_recv() {
        assert_eq!(report.outcome, WriteOutcome::Delivered);
    }
}

#[tokio::test]
async fn test_retry_sequence_ends_in_drop() {
    let message = Message::request("GET /retry HTTP/1.1\r\n\r\n");
    let plugins = Plugins::new()
        .with_source(VecSource::new("vec", vec![message.clone()], SourceTail::End))
        .with_sink(FixedOutcomeSink::new(
            WriteOutcome::Retryable("timeout".into()),
            3,
        ));

    let emitter = Emitter::new(fast_config());
    let mut reports = emitter.subscribe();
    emitter.start(plugins).await.unwrap();

    let mut outcomes = Vec::new();
    while let Ok(report) = reports.try_recv() {
        assert_eq!(report.correlation_id, message.correlation_id.to_string());
        outcomes.push((report.attempt, report.outcome));
    }
    assert_eq!(
        outcomes,
        vec![
            (1, WriteOutcome::Retryable("timeout".into())),
            (2, WriteOutcome::Retryable("timeout".into())),
            (3, WriteOutcome::Retryable("timeout".into())),
            (3, WriteOutcome::Dropped("retry budget exhausted".into())),
        ]
    );
    assert_eq!(
        emitter.metrics().retries.with_label_values(&["fixed"]).get(),
        2
    );
}

#[tokio::test]
async fn test_no_writes_after_close_returns() {
    let messages = requests(10_000);
    let (sink, written) = RecordingSink::new("slow");
    let sink = sink.with_delay(Duration::from_millis(5));
    let plugins = Plugins::new()
        .with_source(VecSource::new("vec", messages, SourceTail::Hang))
        .with_sink(sink);

    let emitter = Arc::new(Emitter::new(fast_config()));
    let running = {
        let emitter = emitter.clone();
        tokio::spawn(async move { emitter.start(plugins).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    emitter.close().await;
    let after_close = written.lock().unwrap().len();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(written.lock().unwrap().len(), after_close);
    assert!(after_close < 10_000);
    assert_eq!(running.await.unwrap().unwrap(), StopReason::Closed);
}

#[tokio::test]
async fn test_close_aborts_writes_after_grace() {
    let plugins = Plugins::new()
        .with_source(VecSource::new("vec", requests(1), SourceTail::Hang))
        .with_sink(StalledSink);

    let mut config = fast_config();
    config.shutdown_grace_ms = 50;
    let emitter = Arc::new(Emitter::new(config));
    let running = {
        let emitter = emitter.clone();
        tokio::spawn(async move { emitter.start(plugins).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    tokio::time::timeout(Duration::from_secs(2), emitter.close())
        .await
        .unwrap();
    assert_eq!(running.await.unwrap().unwrap(), StopReason::Closed);
    assert_eq!(emitter.metrics().in_flight.get(), 0);
}

#[tokio::test]
async fn test_close_returns_at_once_when_idle() {
    let emitter = Emitter::new(fast_config());
    tokio::time::timeout(Duration::from_millis(100), emitter.close())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_close_before_start_is_polled_stops_the_run() {
    let (sink, written) = RecordingSink::new("recording");
    let plugins = Plugins::new()
        .with_source(VecSource::new("vec", requests(5), SourceTail::Hang))
        .with_sink(sink);

    let emitter = Arc::new(Emitter::new(fast_config()));
    let running = {
        let emitter = emitter.clone();
        tokio::spawn(async move { emitter.start(plugins).await })
    };
    // The spawned start has not run yet on this single-threaded runtime.
    emitter.close().await;

    let reason = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, StopReason::Closed);
    assert!(written.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_all_sources_failing_is_fatal() {
    let (sink, _) = RecordingSink::new("recording");
    let plugins = Plugins::new()
        .with_source(VecSource::new("a", requests(2), SourceTail::Fail))
        .with_source(VecSource::new("b", vec![], SourceTail::Fail))
        .with_sink(sink);

    let result = Emitter::new(fast_config()).start(plugins).await;
    assert!(matches!(result, Err(MirrorError::AllSourcesFailed(2))));
}

#[tokio::test]
async fn test_one_surviving_source_is_exhaustion() {
    let (sink, written) = RecordingSink::new("recording");
    let plugins = Plugins::new()
        .with_source(VecSource::new("bad", vec![], SourceTail::Fail))
        .with_source(VecSource::new("good", requests(3), SourceTail::End))
        .with_sink(sink);

    let reason = Emitter::new(fast_config()).start(plugins).await.unwrap();
    assert_eq!(reason, StopReason::SourcesExhausted);
    assert_eq!(written.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_empty_plugin_set_is_rejected() {
    let emitter = Emitter::new(fast_config());
    let result = emitter.start(Plugins::new().with_sink(StalledSink)).await;
    assert!(matches!(result, Err(MirrorError::Config(_))));

    // The emitter cannot be started twice.
    let result = emitter
        .start(Plugins::new().with_source(VecSource::new("v", vec![], SourceTail::End)))
        .await;
    assert!(matches!(result, Err(MirrorError::AlreadyRunning)));
}

#[tokio::test]
async fn test_sink_only_sees_accepted_kinds() {
    let request = Message::request("GET / HTTP/1.1\r\n\r\n");
    let response = request.derive(MessageKind::ResponseCaptured, "HTTP/1.1 200 OK\r\n\r\n");

    let mut sink = MockTrafficSink::new();
    sink.expect_name().return_const("mock".to_string());
    sink.expect_accepts().returning(|kind| kind.is_request());
    sink.expect_max_in_flight().return_const(1usize);
    sink.expect_overflow().return_const(Overflow::Wait);
    sink.expect_retry_budget().return_const(1u32);
    sink.expect_write()
        .withf(|message| message.kind == MessageKind::RequestCaptured)
        .times(1)
        .returning(|_| WriteOutcome::Delivered);
    sink.expect_close().times(1).return_const(());

    let plugins = Plugins::new()
        .with_source(VecSource::new("vec", vec![request, response], SourceTail::End))
        .with_sink(sink);

    let reason = Emitter::new(fast_config()).start(plugins).await.unwrap();
    assert_eq!(reason, StopReason::SourcesExhausted);
}

#[tokio::test]
async fn test_middleware_round_trip() {
    let messages = requests(25);
    let (sink, written) = RecordingSink::new("recording");
    let plugins = Plugins::new()
        .with_source(VecSource::new("vec", messages.clone(), SourceTail::End))
        .with_sink(sink)
        .with_middleware(shell_middleware("cat", FailurePolicy::FailClosed));

    let emitter = Emitter::new(fast_config());
    let mut reports = emitter.subscribe();
    let reason = emitter.start(plugins).await.unwrap();

    assert_eq!(reason, StopReason::SourcesExhausted);
    assert_eq!(*written.lock().unwrap(), messages);
    while let Ok(report) = reports.try_recv() {
        assert_eq!(report.producer, "middleware");
    }
}

#[tokio::test]
async fn test_middleware_failure_in_fail_closed_mode_is_fatal() {
    let (sink, _) = RecordingSink::new("recording");
    let plugins = Plugins::new()
        .with_source(VecSource::new("vec", requests(1), SourceTail::Hang))
        .with_sink(sink)
        .with_middleware(shell_middleware("exit 1", FailurePolicy::FailClosed));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        Emitter::new(fast_config()).start(plugins),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(MirrorError::Middleware(_))));
}

#[tokio::test]
async fn test_middleware_failure_in_fail_open_mode_bypasses() {
    let messages = requests(5);
    let (sink, written) = RecordingSink::new("recording");
    let plugins = Plugins::new()
        .with_source(
            VecSource::new("vec", messages.clone(), SourceTail::End)
                .with_start_delay(Duration::from_millis(300)),
        )
        .with_sink(sink)
        .with_middleware(shell_middleware("exit 1", FailurePolicy::FailOpen));

    let reason = tokio::time::timeout(
        Duration::from_secs(5),
        Emitter::new(fast_config()).start(plugins),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reason, StopReason::SourcesExhausted);
    assert_eq!(*written.lock().unwrap(), messages);
}
