//! The coordinator: one read loop per source, an optional middleware
//! round-trip, and per-sink dispatch lanes.

mod lane;

pub use lane::DispatchReport;

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EmitterConfig, FailurePolicy};
use crate::error::{ConfigError, MiddlewareError, MirrorError, Result};
use crate::input::TrafficSource;
use crate::message::Message;
use crate::metrics::Metrics;
use crate::middleware::MiddlewareBridge;
use crate::output::TrafficSink;
use crate::plugins::Plugins;
use lane::{Dispatcher, LaneSettings, Reporter};

const REPORT_CHANNEL_CAPACITY: usize = 4096;

/// Why `start` returned successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `close` was called
    Closed,
    /// Every source reached the end of its input
    SourcesExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceEnd {
    Exhausted,
    Failed,
    Cancelled,
}

/// How `start` left its main loop.
enum Exit {
    Closed,
    Exhausted,
    AllFailed(usize),
    BridgeFailed,
}

pub struct Emitter {
    config: EmitterConfig,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    phase: watch::Sender<Phase>,
    reports: broadcast::Sender<DispatchReport>,
}

impl Emitter {
    pub fn new(config: EmitterConfig) -> Self {
        Self::with_metrics(config, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(config: EmitterConfig, metrics: Arc<Metrics>) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            config,
            metrics,
            shutdown: CancellationToken::new(),
            phase,
            reports,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Receive a report for every write attempt made from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchReport> {
        self.reports.subscribe()
    }

    /// Run the pipeline until `close`, source exhaustion, or a fatal error.
    pub async fn start(&self, plugins: Plugins) -> Result<StopReason> {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Idle {
                *phase = Phase::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(MirrorError::AlreadyRunning);
        }

        let result = self.run(plugins).await;
        self.phase.send_replace(Phase::Stopped);
        result
    }

    /// Stop all loops, give in-flight writes the grace period, then abort
    /// them. No sink write happens after this returns.
    ///
    /// Closing before `start` has been polled makes that `start` return
    /// `Closed` without reading anything.
    pub async fn close(&self) {
        let phase = *self.phase.borrow();
        match phase {
            Phase::Stopped => return,
            Phase::Idle => {
                debug!("Close requested before start");
                self.shutdown.cancel();
                return;
            }
            Phase::Running => {}
        }
        info!("Closing emitter");
        self.shutdown.cancel();

        let mut phase = self.phase.subscribe();
        let _ = phase.wait_for(|p| *p == Phase::Stopped).await;
    }

    async fn run(&self, plugins: Plugins) -> Result<StopReason> {
        let Plugins {
            sources,
            sinks,
            middleware,
            feedback,
        } = plugins;

        if sources.is_empty() || sinks.is_empty() {
            return Err(ConfigError::Validation(
                "Required at least 1 input and 1 output".into(),
            )
            .into());
        }

        if self.shutdown.is_cancelled() {
            info!("Emitter closed before it started");
            for sink in &sinks {
                sink.close().await;
            }
            return Ok(StopReason::Closed);
        }

        let settings = LaneSettings {
            capacity: self.config.lane_capacity,
            backoff: self.config.retry_backoff(),
            backoff_max: self.config.retry_backoff_max(),
        };
        let reporter = Reporter {
            metrics: self.metrics.clone(),
            reports: self.reports.clone(),
        };

        let (bridge, policy) = match &middleware {
            Some(config) => (
                Some(Arc::new(
                    MiddlewareBridge::spawn(config, self.metrics.clone()).await?,
                )),
                config.on_failure,
            ),
            None => (None, FailurePolicy::default()),
        };
        let bypass = Arc::new(AtomicBool::new(false));

        let mut lanes = JoinSet::new();
        // Pumps stop independently of lanes so lanes can drain after them.
        let pumps_token = self.shutdown.child_token();
        let mut bridge_pump = None;
        let mut feedback_pump = None;

        if let Some(bridge) = &bridge {
            let dispatcher = Dispatcher::open(
                "middleware",
                &sinks,
                &settings,
                &reporter,
                &self.shutdown,
                &mut lanes,
            );
            let inbound = bridge.receive().await?;
            bridge_pump = Some(tokio::spawn(pump(inbound, dispatcher, pumps_token.clone())));
        }

        if let Some(feedback) = feedback {
            let dispatcher = Dispatcher::open(
                "feedback",
                &sinks,
                &settings,
                &reporter,
                &self.shutdown,
                &mut lanes,
            );
            let stream = tokio_stream::wrappers::ReceiverStream::new(feedback);
            feedback_pump = Some(tokio::spawn(pump(stream, dispatcher, pumps_token.clone())));
        }

        let total = sources.len();
        let mut readers = JoinSet::new();
        for source in sources {
            let dispatcher = Dispatcher::open(
                source.name().to_string(),
                &sinks,
                &settings,
                &reporter,
                &self.shutdown,
                &mut lanes,
            );
            let router = Router {
                dispatcher,
                bridge: bridge.clone(),
                policy,
                bypass: bypass.clone(),
            };
            readers.spawn(read_loop(
                source,
                router,
                self.metrics.clone(),
                self.shutdown.clone(),
            ));
        }

        info!(
            sources = total,
            sinks = sinks.len(),
            middleware = bridge.is_some(),
            "Emitter started"
        );

        let mut failed = 0;
        let mut ended = 0;
        let mut watch_bridge = bridge.is_some();
        let exit = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Exit::Closed,
                _ = wait_failed(bridge.as_deref()), if watch_bridge => {
                    watch_bridge = false;
                    match policy {
                        FailurePolicy::FailClosed => break Exit::BridgeFailed,
                        FailurePolicy::FailOpen => {
                            warn!("Middleware failed, sending messages straight to outputs");
                            bypass.store(true, Ordering::Release);
                        }
                    }
                }
                Some(end) = readers.join_next() => {
                    ended += 1;
                    if !matches!(end, Ok(SourceEnd::Exhausted) | Ok(SourceEnd::Cancelled)) {
                        failed += 1;
                    }
                    if ended == total {
                        break if failed == total {
                            Exit::AllFailed(total)
                        } else {
                            Exit::Exhausted
                        };
                    }
                }
            }
        };

        if matches!(exit, Exit::BridgeFailed | Exit::Closed) {
            self.shutdown.cancel();
        }
        readers.shutdown().await;

        if let Some(bridge) = &bridge {
            if matches!(exit, Exit::Exhausted) {
                // Collect what the middleware still holds before stopping it.
                bridge.finish().await;
                if let Some(handle) = bridge_pump.take() {
                    let _ = handle.await;
                }
            } else {
                bridge.close().await;
            }
        }
        pumps_token.cancel();
        for handle in [bridge_pump, feedback_pump].into_iter().flatten() {
            let _ = handle.await;
        }

        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while lanes.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "In-flight writes did not finish in time, aborting"
            );
            self.shutdown.cancel();
            lanes.shutdown().await;
        }

        for sink in &sinks {
            sink.close().await;
        }

        match exit {
            Exit::Closed => {
                info!("Emitter closed");
                Ok(StopReason::Closed)
            }
            Exit::Exhausted => {
                info!("All sources exhausted");
                Ok(StopReason::SourcesExhausted)
            }
            Exit::AllFailed(count) => {
                error!(sources = count, "All sources failed");
                Err(MirrorError::AllSourcesFailed(count))
            }
            Exit::BridgeFailed => {
                Err(MiddlewareError::Exited("middleware failed in fail-closed mode".into()).into())
            }
        }
    }
}

async fn wait_failed(bridge: Option<&MiddlewareBridge>) {
    match bridge {
        Some(bridge) => bridge.failed().await,
        None => std::future::pending().await,
    }
}

/// Where a source's messages go: through the middleware when one runs,
/// otherwise straight to the lanes.
struct Router {
    dispatcher: Dispatcher,
    bridge: Option<Arc<MiddlewareBridge>>,
    policy: FailurePolicy,
    bypass: Arc<AtomicBool>,
}

impl Router {
    async fn route(&self, message: Arc<Message>) {
        if let Some(bridge) = &self.bridge {
            if !self.bypass.load(Ordering::Acquire) {
                match bridge.send(message.clone()).await {
                    Ok(()) => return,
                    Err(e) if self.policy == FailurePolicy::FailClosed => {
                        debug!(correlation_id = %message.correlation_id, "Not forwarded: {}", e);
                        return;
                    }
                    Err(_) => {}
                }
            }
        }
        self.dispatcher.dispatch(message).await;
    }
}

async fn read_loop(
    mut source: Box<dyn TrafficSource>,
    router: Router,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> SourceEnd {
    let name = source.name().to_string();
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return SourceEnd::Cancelled,
            next = source.next() => next,
        };
        match next {
            Ok(Some(message)) => {
                metrics.record_read(&name);
                tokio::select! {
                    _ = shutdown.cancelled() => return SourceEnd::Cancelled,
                    _ = router.route(Arc::new(message)) => {}
                }
            }
            Ok(None) => {
                info!(source = %name, "Source finished");
                return SourceEnd::Exhausted;
            }
            Err(e) => {
                error!(source = %name, "Source failed: {}", e);
                return SourceEnd::Failed;
            }
        }
    }
}

async fn pump<S>(mut stream: S, dispatcher: Dispatcher, stop: CancellationToken)
where
    S: futures::Stream<Item = Message> + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => return,
            message = stream.next() => message,
        };
        match message {
            Some(message) => dispatcher.dispatch(Arc::new(message)).await,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests;
