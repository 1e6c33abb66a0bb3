//! The seam between the adapter and the database connectors it embeds.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::checkpoints::OffsetMap;
use crate::config::ConnectorConfiguration;
use crate::consumer::Consumer;
use crate::error::SourceError;

/// A database connector speaking the source's replication protocol.
///
/// The engine runner calls [`connect`](Connector::connect) once and then
/// [`run`](Connector::run) on the same dedicated task. Both are expected to
/// propagate fatal errors rather than retry them.
#[async_trait]
pub trait Connector: Send {
    /// Reaches the source and positions the connector at `resume`,
    /// or at its configured starting position when `resume` is empty.
    async fn connect(&mut self, resume: &OffsetMap) -> anyhow::Result<()>;

    /// Reads changes and pushes them into `consumer` in emission order,
    /// until `stop` turns `true` or the source is exhausted.
    async fn run(
        &mut self,
        consumer: &mut dyn Consumer,
        stop: watch::Receiver<bool>,
    ) -> anyhow::Result<()>;
}

/// Trait used to represent a factory of [`Connector`] instances.
/// A new connector is created for every started engine.
#[async_trait]
pub trait ConnectorFactory: Sync + Send {
    async fn new_connector(
        &self,
        config: &ConnectorConfiguration,
    ) -> anyhow::Result<Box<dyn Connector>>;
}

/// Resolves a configuration's connector class to the factory building it.
#[derive(Clone)]
pub struct ConnectorRegistry {
    factories: HashMap<String, Arc<dyn ConnectorFactory>>,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut registry = ConnectorRegistry::empty();

        #[cfg(feature = "mysql")]
        {
            let factory: Arc<dyn ConnectorFactory> = Arc::new(crate::mysql::MySqlConnectorFactory);
            registry.register(crate::mysql::CONNECTOR_NAME, Arc::clone(&factory));
            registry.register(crate::mysql::DEBEZIUM_CONNECTOR_CLASS, factory);
        }

        registry
    }
}

impl ConnectorRegistry {
    /// A registry without any connectors.
    pub fn empty() -> ConnectorRegistry {
        ConnectorRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, connector_class: impl Into<String>, factory: Arc<dyn ConnectorFactory>) {
        self.factories.insert(connector_class.into(), factory);
    }

    pub fn with(mut self, connector_class: impl Into<String>, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.register(connector_class, factory);
        self
    }

    pub fn contains(&self, connector_class: &str) -> bool {
        self.factories.contains_key(connector_class)
    }

    /// Builds a connector for `config`. Fails with a configuration error
    /// if the class is unknown or the factory rejects the properties.
    pub async fn create(
        &self,
        config: &ConnectorConfiguration,
    ) -> Result<Box<dyn Connector>, SourceError> {
        let class = config
            .connector_class()
            .ok_or_else(|| SourceError::configuration("connector class is required"))?;
        let factory = self.factories.get(class).ok_or_else(|| {
            SourceError::configuration(format!("unknown connector class {class:?}"))
        })?;

        factory
            .new_connector(config)
            .await
            .map_err(|e| SourceError::configuration(format!("{e:#}")))
    }
}
