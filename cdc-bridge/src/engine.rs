//! Lifecycle of one embedded connector instance.
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cdc_types::ChangeEvent;
use crate::checkpoints::{representative, OffsetMap};
use crate::config::ConnectorConfiguration;
use crate::connector::ConnectorRegistry;
use crate::consumer::{raised, QueueClosed, QueueConsumer};
use crate::error::SourceError;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Capacity of the queue between the connector and the reader.
    pub queue_capacity: usize,
    /// How long the connector may take to reach the source.
    pub start_timeout: Duration,
    /// How long a stopping connector may take before its task is cancelled.
    pub stop_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Result of taking one event off the queue.
#[derive(Debug)]
pub(crate) enum Dequeued {
    Event(ChangeEvent),
    /// Nothing arrived within the allowed wait.
    Timeout,
    /// The reader was closed while waiting.
    Closed,
    /// The connector finished and everything it produced was taken.
    Exhausted,
}

/// Runs a connector on its own task and exposes the events it pushes
/// through a bounded queue.
///
/// Dropping the runner cancels the connector task.
pub struct EmbeddedEngineRunner {
    instance_id: Uuid,
    connector_class: String,
    events: mpsc::Receiver<ChangeEvent>,
    stop: watch::Sender<bool>,
    stop_timeout: Duration,
    handle: Option<RemoteHandle<anyhow::Result<()>>>,
    outcome: Option<anyhow::Result<()>>,
}

impl EmbeddedEngineRunner {
    /// Creates the connector for `config` and starts it, positioned at `resume`.
    ///
    /// Returns once the connector reached the source. Failing to do so within
    /// `options.start_timeout` cancels the connector task.
    pub async fn start(
        config: &ConnectorConfiguration,
        resume: OffsetMap,
        registry: &ConnectorRegistry,
        options: &EngineOptions,
    ) -> Result<EmbeddedEngineRunner, SourceError> {
        config.validate()?;
        if options.queue_capacity == 0 {
            return Err(SourceError::configuration("queue capacity must be positive"));
        }

        let mut connector = registry.create(config).await?;
        let connector_class = config.connector_class().unwrap_or_default().to_string();
        let instance_id = Uuid::new_v4();
        let span = info_span!("engine", id = %instance_id, connector = %connector_class);
        let last_offset = representative(&resume);

        let (sender, events) = mpsc::channel(options.queue_capacity);
        let (stop, stop_receiver) = watch::channel(false);
        let (ready_sender, ready) = oneshot::channel::<()>();

        let task = async move {
            let mut consumer = QueueConsumer::new(sender, stop_receiver.clone());
            connector.connect(&resume).await?;
            info!("Connector connected");
            let _ = ready_sender.send(());
            connector.run(&mut consumer, stop_receiver).await
        }
        .instrument(span.clone());
        let task = AssertUnwindSafe(task).catch_unwind().map(|outcome| {
            outcome.unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("connector panicked: {}", panic_message(&*panic)))
            })
        });

        let (fut, handle) = task.remote_handle();
        tokio::task::spawn(fut);

        match tokio::time::timeout(options.start_timeout, ready).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // The task dropped the readiness signal, so it has already finished.
                let err = match handle.await {
                    Err(err) => err,
                    Ok(()) => anyhow::anyhow!("connector exited before reaching the source"),
                };
                span.in_scope(|| warn!("Connector failed to start: {:#}", err));
                return Err(SourceError::engine_start(&err, last_offset));
            }
            Err(_) => {
                drop(handle);
                let err = anyhow::anyhow!(
                    "connector did not reach the source within {:?}",
                    options.start_timeout
                );
                span.in_scope(|| warn!("{}", err));
                return Err(SourceError::engine_start(&err, last_offset));
            }
        }

        span.in_scope(|| info!("Engine started"));
        Ok(EmbeddedEngineRunner {
            instance_id,
            connector_class,
            events,
            stop,
            stop_timeout: options.stop_timeout,
            handle: Some(handle),
            outcome: None,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn connector_class(&self) -> &str {
        &self.connector_class
    }

    /// Takes the next event off the queue, waiting at most `wait` if given.
    pub(crate) async fn dequeue(
        &mut self,
        close: &mut watch::Receiver<bool>,
        wait: Option<Duration>,
    ) -> Dequeued {
        if *close.borrow() {
            return Dequeued::Closed;
        }

        let events = &mut self.events;
        let receive = async move {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => Dequeued::Event(event),
                    None => Dequeued::Exhausted,
                },
                _ = raised(close) => Dequeued::Closed,
            }
        };

        match wait {
            Some(wait) => tokio::time::timeout(wait, receive)
                .await
                .unwrap_or(Dequeued::Timeout),
            None => receive.await,
        }
    }

    /// Asks the connector to stop and waits for its run loop to return.
    /// Calling it again does nothing.
    pub async fn stop(&mut self) {
        self.stop.send_replace(true);
        let Some(handle) = self.handle.take() else {
            return;
        };

        match tokio::time::timeout(self.stop_timeout, handle).await {
            Ok(outcome) => {
                debug!(engine = %self.instance_id, "Connector run loop returned");
                self.outcome = Some(outcome);
            }
            Err(_) => {
                // Dropping the handle has cancelled the task.
                warn!(
                    engine = %self.instance_id,
                    "Connector did not stop within {:?}, its task was cancelled",
                    self.stop_timeout
                );
                self.outcome = Some(Ok(()));
            }
        }
        self.events.close();
        info!(engine = %self.instance_id, "Engine stopped");
    }

    /// Outcome of the connector's run loop. Meant to be called once the queue
    /// is exhausted, i.e. once the connector task is finishing.
    ///
    /// Being released from a full queue by a stop request counts as success.
    pub async fn wait(&mut self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.take() {
            self.outcome = Some(handle.await);
        }
        match self.outcome.take().unwrap_or(Ok(())) {
            Err(err) if err.is::<QueueClosed>() => Ok(()),
            outcome => outcome,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("no message")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::test_utilities::{
        script_offset, scripted_config, scripted_registry, scripted_registry_with, Script,
        ScriptedConnectorFactory,
    };

    fn options() -> EngineOptions {
        EngineOptions {
            queue_capacity: 4,
            start_timeout: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(1),
        }
    }

    async fn drain(runner: &mut EmbeddedEngineRunner) -> Vec<u64> {
        let (_close_sender, mut close) = watch::channel(false);
        let mut seqs = vec![];
        while let Dequeued::Event(event) = runner.dequeue(&mut close, None).await {
            seqs.push(event.offset().get_u64("seq").unwrap());
        }
        seqs
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let registry = scripted_registry(Script::new().events(10));
        let mut runner =
            EmbeddedEngineRunner::start(&scripted_config(), OffsetMap::new(), &registry, &options())
                .await
                .unwrap();

        assert_eq!(drain(&mut runner).await, (1..=10).collect::<Vec<_>>());
        assert!(runner.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_resume_skips_delivered_events() {
        let registry = scripted_registry(Script::new().events(5));
        let record = script_offset(3);
        let resume = OffsetMap::from([(record.partition.clone(), record)]);

        let mut runner =
            EmbeddedEngineRunner::start(&scripted_config(), resume, &registry, &options())
                .await
                .unwrap();

        assert_eq!(drain(&mut runner).await, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_connect_failure_is_start_error() {
        let registry = scripted_registry(Script::new().connect_error("access denied for user"));
        let err = EmbeddedEngineRunner::start(
            &scripted_config(),
            OffsetMap::new(),
            &registry,
            &options(),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(&err, SourceError::EngineStart { reason, .. } if reason.contains("access denied")));
    }

    #[tokio::test]
    async fn test_slow_connect_times_out() {
        let factory = Arc::new(ScriptedConnectorFactory::new(
            Script::new().connect_delay(Duration::from_secs(5)),
        ));
        let registry = scripted_registry_with(Arc::clone(&factory));
        let started = tokio::time::Instant::now();
        let err = EmbeddedEngineRunner::start(
            &scripted_config(),
            OffsetMap::new(),
            &registry,
            &options(),
        )
        .await
        .err()
        .unwrap();

        assert!(err.is_retriable());
        assert!(started.elapsed() < Duration::from_secs(5));

        // The abandoned connector task is cancelled and drops its connector.
        assert_eq!(factory.created(), 1);
        for _ in 0..100 {
            if factory.released() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(factory.released(), 1);
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_rejected_before_start() {
        let factory = Arc::new(ScriptedConnectorFactory::new(Script::new()));
        let registry = scripted_registry_with(Arc::clone(&factory));
        let config = ConnectorConfiguration::create().with_connector_class("scripted");
        let err = EmbeddedEngineRunner::start(&config, OffsetMap::new(), &registry, &options())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::Configuration(_)));
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_connector_panic_is_reported_as_error() {
        let registry = scripted_registry(Script::new().events(5).panic_after(2, "connector crashed"));
        let mut runner =
            EmbeddedEngineRunner::start(&scripted_config(), OffsetMap::new(), &registry, &options())
                .await
                .unwrap();

        assert_eq!(drain(&mut runner).await, vec![1, 2]);
        let err = runner.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "connector panicked: connector crashed");
        runner.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_blocked_connector() {
        let registry = scripted_registry(Script::new().endless());
        let mut runner =
            EmbeddedEngineRunner::start(&scripted_config(), OffsetMap::new(), &registry, &options())
                .await
                .unwrap();

        // Let the connector fill the queue and block on it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(2), runner.stop())
            .await
            .unwrap();
        runner.stop().await;

        assert!(runner.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_fault_is_reported_after_queue() {
        let registry =
            scripted_registry(Script::new().events(10).fail_after(3, "connection reset by peer"));
        let mut runner =
            EmbeddedEngineRunner::start(&scripted_config(), OffsetMap::new(), &registry, &options())
                .await
                .unwrap();

        assert_eq!(drain(&mut runner).await, vec![1, 2, 3]);
        let err = runner.wait().await.unwrap_err();
        assert!(format!("{err:#}").contains("connection reset by peer"));
        assert_eq!(
            SourceError::engine_fault(&err, None).to_string(),
            "engine fault: connection reset by peer (no offset delivered yet)"
        );
    }

    #[tokio::test]
    async fn test_close_signal_interrupts_dequeue() {
        let registry = scripted_registry(Script::new().hold_open());
        let mut runner =
            EmbeddedEngineRunner::start(&scripted_config(), OffsetMap::new(), &registry, &options())
                .await
                .unwrap();

        let (close_sender, mut close) = watch::channel(false);
        assert!(matches!(
            runner
                .dequeue(&mut close, Some(Duration::from_millis(20)))
                .await,
            Dequeued::Timeout
        ));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            close_sender.send_replace(true);
        });
        assert!(matches!(
            runner.dequeue(&mut close, None).await,
            Dequeued::Closed
        ));
        runner.stop().await;
    }
}
