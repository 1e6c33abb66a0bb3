use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::cdc_types::{ChangeEvent, OffsetRecord, RowImage, SourceMetadata, SourceOffset, SourcePartition};
use crate::checkpoints::OffsetMap;
use crate::config::ConnectorConfiguration;
use crate::connector::{Connector, ConnectorFactory, ConnectorRegistry};
use crate::consumer::{raised, Consumer};

pub const SCRIPTED_CONNECTOR_CLASS: &str = "scripted";
pub const SCRIPT_PARTITION: &str = "script";
pub const SCRIPT_TABLE: &str = "items";

/// Event number `seq` of a script: an insert into `items` with offset `{"seq": seq}`.
pub fn scripted_event(seq: u64) -> ChangeEvent {
    ChangeEvent::insert(
        SourcePartition::new(SCRIPT_PARTITION),
        SourceOffset::new().with("seq", seq),
        SourceMetadata {
            connector: SCRIPTED_CONNECTOR_CLASS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            name: "scripted".to_string(),
            database: "test".to_string(),
            schema: String::new(),
            table: SCRIPT_TABLE.to_string(),
        },
        RowImage::new()
            .with("id", seq)
            .with("name", format!("item {seq}")),
    )
}

pub fn script_offset(seq: u64) -> OffsetRecord {
    OffsetRecord::new(
        SourcePartition::new(SCRIPT_PARTITION),
        SourceOffset::new().with("seq", seq),
    )
}

/// What a [`ScriptedConnector`] does once started.
#[derive(Debug, Clone, Default)]
pub struct Script {
    events: Vec<ChangeEvent>,
    connect_delay: Option<Duration>,
    connect_error: Option<String>,
    fail_after: Option<(usize, String)>,
    panic_after: Option<(usize, String)>,
    hold_open: bool,
    endless: bool,
}

impl Script {
    pub fn new() -> Script {
        Script::default()
    }

    /// Emits events `1..=count`.
    pub fn events(self, count: u64) -> Self {
        self.with_events((1..=count).map(scripted_event).collect())
    }

    /// Emits the given events. Each must carry a `seq` offset for resuming to work.
    pub fn with_events(mut self, events: Vec<ChangeEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn connect_error(mut self, message: impl Into<String>) -> Self {
        self.connect_error = Some(message.into());
        self
    }

    /// Fails the run loop with `message` after emitting `count` events.
    pub fn fail_after(mut self, count: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((count, message.into()));
        self
    }

    /// Panics in the run loop with `message` after emitting `count` events.
    pub fn panic_after(mut self, count: usize, message: impl Into<String>) -> Self {
        self.panic_after = Some((count, message.into()));
        self
    }

    /// Keeps the run loop alive after the last event until stopped.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Keeps generating events after the scripted ones until stopped.
    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }
}

pub struct ScriptedConnector {
    script: Script,
    resume_after: u64,
    released: Arc<AtomicUsize>,
}

impl Drop for ScriptedConnector {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&mut self, resume: &OffsetMap) -> anyhow::Result<()> {
        if let Some(delay) = self.script.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.script.connect_error {
            bail!("{}", message);
        }
        self.resume_after = resume
            .get(&SourcePartition::new(SCRIPT_PARTITION))
            .and_then(|record| record.offset.get_u64("seq"))
            .unwrap_or(0);
        Ok(())
    }

    async fn run(
        &mut self,
        consumer: &mut dyn Consumer,
        mut stop: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let resume_after = self.resume_after;
        let scripted = self
            .script
            .events
            .iter()
            .filter(|event| event.offset().get_u64("seq").map_or(true, |seq| seq > resume_after))
            .cloned();
        let last_seq = self
            .script
            .events
            .iter()
            .filter_map(|event| event.offset().get_u64("seq"))
            .max()
            .unwrap_or(0)
            .max(resume_after);
        let generated = (last_seq + 1..)
            .take_while(|_| self.script.endless)
            .map(scripted_event);

        let mut emitted = 0;
        for event in scripted.chain(generated) {
            if *stop.borrow() {
                return Ok(());
            }
            if let Some((count, message)) = &self.script.fail_after {
                if emitted == *count {
                    bail!("{}", message);
                }
            }
            if let Some((count, message)) = &self.script.panic_after {
                if emitted == *count {
                    panic!("{}", message);
                }
            }
            consumer.consume_cdc(event).await?;
            emitted += 1;
        }

        if let Some((_, message)) = &self.script.fail_after {
            bail!("{}", message);
        }
        if self.script.hold_open {
            raised(&mut stop).await;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedConnectorFactory {
    script: Script,
    created: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl ScriptedConnectorFactory {
    pub fn new(script: Script) -> ScriptedConnectorFactory {
        ScriptedConnectorFactory {
            script,
            ..Default::default()
        }
    }

    /// Number of connectors handed out so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of connectors dropped so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectorFactory for ScriptedConnectorFactory {
    async fn new_connector(
        &self,
        _config: &ConnectorConfiguration,
    ) -> anyhow::Result<Box<dyn Connector>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnector {
            script: self.script.clone(),
            resume_after: 0,
            released: Arc::clone(&self.released),
        }))
    }
}

pub fn scripted_registry(script: Script) -> ConnectorRegistry {
    scripted_registry_with(Arc::new(ScriptedConnectorFactory::new(script)))
}

/// Registry serving connectors from `factory`, which the caller keeps to
/// observe them.
pub fn scripted_registry_with(factory: Arc<ScriptedConnectorFactory>) -> ConnectorRegistry {
    ConnectorRegistry::empty().with(SCRIPTED_CONNECTOR_CLASS, factory)
}

pub fn scripted_config() -> ConnectorConfiguration {
    ConnectorConfiguration::create()
        .with_connector_class(SCRIPTED_CONNECTOR_CLASS)
        .with_username("test")
        .with_password("test")
        .with_host_name("localhost")
        .with_port(1)
}
