//! Dispatch lanes: the ordered path from one producer to one sink.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::{CorrelationId, Message, MessageKind};
use crate::metrics::Metrics;
use crate::output::{Overflow, TrafficSink, WriteOutcome};

/// Outcome of one write attempt, or of a message that never reached the
/// sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub producer: String,
    pub sink: String,
    pub correlation_id: String,
    pub kind: MessageKind,
    /// 1-based attempt number; 0 when no write was attempted
    pub attempt: u32,
    #[serde(serialize_with = "outcome_as_string")]
    pub outcome: WriteOutcome,
}

fn outcome_as_string<S: serde::Serializer>(
    outcome: &WriteOutcome,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(outcome)
}

#[derive(Clone)]
pub(crate) struct Reporter {
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) reports: broadcast::Sender<DispatchReport>,
}

impl Reporter {
    fn report(
        &self,
        producer: &str,
        sink: &str,
        correlation_id: CorrelationId,
        kind: MessageKind,
        attempt: u32,
        outcome: WriteOutcome,
    ) {
        self.metrics.record_outcome(sink, &outcome);
        match &outcome {
            WriteOutcome::Delivered => {
                debug!(%producer, %sink, %correlation_id, attempt, "Delivered")
            }
            WriteOutcome::Retryable(reason) => {
                debug!(%producer, %sink, %correlation_id, attempt, %reason, "Write failed, retryable")
            }
            WriteOutcome::Dropped(reason) => {
                warn!(%producer, %sink, %correlation_id, attempt, %reason, "Message dropped")
            }
        }
        // Nobody listening is fine.
        let _ = self.reports.send(DispatchReport {
            producer: producer.to_string(),
            sink: sink.to_string(),
            correlation_id: correlation_id.to_string(),
            kind,
            attempt,
            outcome,
        });
    }
}

#[derive(Clone)]
pub(crate) struct LaneSettings {
    pub(crate) capacity: usize,
    pub(crate) backoff: Duration,
    pub(crate) backoff_max: Duration,
}

struct Lane {
    sink: Arc<dyn TrafficSink>,
    sink_name: String,
    overflow: Overflow,
    tx: mpsc::Sender<Arc<Message>>,
}

/// Fans one producer's messages out to a lane per sink. Dropping the
/// dispatcher lets its lanes drain and finish.
pub(crate) struct Dispatcher {
    producer: String,
    lanes: Vec<Lane>,
    reporter: Reporter,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn open(
        producer: impl Into<String>,
        sinks: &[Arc<dyn TrafficSink>],
        settings: &LaneSettings,
        reporter: &Reporter,
        shutdown: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) -> Self {
        let producer = producer.into();
        let lanes = sinks
            .iter()
            .map(|sink| {
                let (tx, rx) = mpsc::channel(settings.capacity.max(1));
                tasks.spawn(run_lane(
                    producer.clone(),
                    sink.clone(),
                    rx,
                    settings.clone(),
                    reporter.clone(),
                    shutdown.clone(),
                ));
                Lane {
                    sink: sink.clone(),
                    sink_name: sink.name().to_string(),
                    overflow: sink.overflow(),
                    tx,
                }
            })
            .collect();

        Self {
            producer,
            lanes,
            reporter: reporter.clone(),
            shutdown: shutdown.clone(),
        }
    }

    /// Hand a message to every sink that accepts its kind. A full lane either
    /// holds the producer or drops the message, as its sink asks.
    pub(crate) async fn dispatch(&self, message: Arc<Message>) {
        for lane in &self.lanes {
            if !lane.sink.accepts(message.kind) {
                continue;
            }
            let overflowed = match lane.overflow {
                Overflow::Drop => match lane.tx.try_send(message.clone()) {
                    Err(mpsc::error::TrySendError::Full(_)) => Some("lane full"),
                    // The lane stopped during shutdown.
                    Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => None,
                },
                Overflow::Wait => tokio::select! {
                    biased;
                    _ = lane.tx.send(message.clone()) => None,
                    _ = self.shutdown.cancelled() => Some("shutting down"),
                },
            };
            if let Some(reason) = overflowed {
                self.reporter.report(
                    &self.producer,
                    &lane.sink_name,
                    message.correlation_id,
                    message.kind,
                    0,
                    WriteOutcome::Dropped(reason.into()),
                );
            }
        }
    }
}

/// Start writes in arrival order with at most `max_in_flight` outstanding.
async fn run_lane(
    producer: String,
    sink: Arc<dyn TrafficSink>,
    mut rx: mpsc::Receiver<Arc<Message>>,
    settings: LaneSettings,
    reporter: Reporter,
    shutdown: CancellationToken,
) {
    let max_in_flight = sink.max_in_flight().max(1);
    let mut in_flight = FuturesUnordered::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            message = rx.recv(), if in_flight.len() < max_in_flight => match message {
                Some(message) => in_flight.push(deliver(
                    &producer,
                    sink.as_ref(),
                    message,
                    &settings,
                    &reporter,
                    &shutdown,
                )),
                None => break,
            },
        }
    }

    // Let started writes finish; the emitter aborts the lane after the grace
    // period.
    while in_flight.next().await.is_some() {}
}

/// Keeps the in-flight gauge accurate even when a write is aborted.
struct InFlight<'a>(&'a Metrics);

impl<'a> InFlight<'a> {
    fn start(metrics: &'a Metrics) -> Self {
        metrics.in_flight.inc();
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.dec();
    }
}

/// Write one message, retrying `Retryable` outcomes with exponential backoff
/// until the sink's attempt budget is spent.
async fn deliver(
    producer: &str,
    sink: &dyn TrafficSink,
    message: Arc<Message>,
    settings: &LaneSettings,
    reporter: &Reporter,
    shutdown: &CancellationToken,
) {
    let budget = sink.retry_budget().max(1);
    let name = sink.name();
    let mut backoff = settings.backoff;

    for attempt in 1..=budget {
        let outcome = {
            let _in_flight = InFlight::start(&reporter.metrics);
            let started = Instant::now();
            let outcome = sink.write(message.clone()).await;
            reporter.metrics.record_write_duration(started.elapsed());
            outcome
        };

        let retry = matches!(outcome, WriteOutcome::Retryable(_));
        reporter.report(
            producer,
            name,
            message.correlation_id,
            message.kind,
            attempt,
            outcome,
        );
        if !retry {
            return;
        }
        if attempt == budget {
            break;
        }

        reporter.metrics.record_retry(name);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.cancelled() => {
                reporter.report(
                    producer,
                    name,
                    message.correlation_id,
                    message.kind,
                    attempt,
                    WriteOutcome::Dropped("shutting down".into()),
                );
                return;
            }
        }
        backoff = (backoff * 2).min(settings.backoff_max);
    }

    reporter.report(
        producer,
        name,
        message.correlation_id,
        message.kind,
        budget,
        WriteOutcome::Dropped("retry budget exhausted".into()),
    );
}
