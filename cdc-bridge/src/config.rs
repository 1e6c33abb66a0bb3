//! Connector configuration.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::SourceError;

const CONNECTOR_CLASS_KEY: &str = "connector.class";
const HOSTNAME_KEY: &str = "database.hostname";
const PORT_KEY: &str = "database.port";
const USER_KEY: &str = "database.user";
const PASSWORD_KEY: &str = "database.password";

/// Immutable description of the connector to embed: its class, credentials,
/// endpoint and arbitrary connector-specific properties.
///
/// Every `with_*` call returns a new value; nothing is validated until
/// the engine starts (see [`validate`](Self::validate)).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectorConfiguration {
    connector_class: Option<String>,
    username: Option<String>,
    password: Option<String>,
    host_name: Option<String>,
    port: Option<u16>,
    properties: HashMap<String, String>,
}

impl fmt::Debug for ConnectorConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfiguration")
            .field("connector_class", &self.connector_class)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("host_name", &self.host_name)
            .field("port", &self.port)
            .field("properties", &self.properties)
            .finish()
    }
}

impl ConnectorConfiguration {
    pub fn create() -> ConnectorConfiguration {
        ConnectorConfiguration::default()
    }

    /// Builds a configuration from flat Debezium-style keys.
    /// Keys that are not part of the fixed fields end up in the property map.
    pub fn from_properties<K, V>(
        properties: impl IntoIterator<Item = (K, V)>,
    ) -> Result<ConnectorConfiguration, SourceError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut config = ConnectorConfiguration::create();
        for (key, value) in properties {
            let key = key.into();
            let value = value.into();
            config = match key.as_str() {
                CONNECTOR_CLASS_KEY => config.with_connector_class(value),
                HOSTNAME_KEY => config.with_host_name(value),
                USER_KEY => config.with_username(value),
                PASSWORD_KEY => config.with_password(value),
                PORT_KEY => {
                    let port = value.trim().parse::<u16>().map_err(|_| {
                        SourceError::configuration(format!("invalid {PORT_KEY}: {value:?}"))
                    })?;
                    config.with_port(port)
                }
                _ => config.with_connection_property(key, value),
            };
        }
        Ok(config)
    }

    pub fn with_connector_class(mut self, connector_class: impl Into<String>) -> Self {
        self.connector_class = Some(connector_class.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_connection_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn connector_class(&self) -> Option<&str> {
        self.connector_class.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn host_name(&self) -> Option<&str> {
        self.host_name.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parses a property, failing with a configuration error if it is malformed.
    pub fn parse_property<T: FromStr>(&self, key: &str) -> Result<Option<T>, SourceError> {
        match self.property(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                SourceError::configuration(format!("invalid value for {key}: {raw:?}"))
            }),
        }
    }

    pub fn flag(&self, key: &str, default: bool) -> Result<bool, SourceError> {
        Ok(self.parse_property::<bool>(key)?.unwrap_or(default))
    }

    /// Splits a comma-separated property, skipping blank entries.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.property(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Checks the fields every connector needs. Called when the engine starts.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.connector_class().map_or(true, |class| class.trim().is_empty()) {
            return Err(SourceError::configuration("connector class is required"));
        }
        if self.host_name().map_or(true, |host| host.trim().is_empty()) {
            return Err(SourceError::configuration("host name is required"));
        }
        if self.port.is_none() {
            return Err(SourceError::configuration("port is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> ConnectorConfiguration {
        ConnectorConfiguration::create()
            .with_connector_class("mysql")
            .with_username("debezium")
            .with_password("dbz")
            .with_host_name("localhost")
            .with_port(3306)
    }

    #[test]
    fn copies_do_not_share_state() {
        let base = complete();
        let extended = base
            .clone()
            .with_connection_property("database.server.id", "184054");

        assert_eq!(base.property("database.server.id"), None);
        assert_eq!(extended.property("database.server.id"), Some("184054"));
    }

    #[test]
    fn validation_is_lazy() {
        let config = ConnectorConfiguration::create().with_username("debezium");
        assert!(matches!(
            config.validate(),
            Err(SourceError::Configuration(msg)) if msg.contains("connector class")
        ));

        let config = config.with_connector_class("mysql");
        assert!(matches!(
            config.validate(),
            Err(SourceError::Configuration(msg)) if msg.contains("host name")
        ));

        let config = config.with_host_name("localhost");
        assert!(matches!(
            config.validate(),
            Err(SourceError::Configuration(msg)) if msg.contains("port")
        ));

        assert!(complete().validate().is_ok());
    }

    #[test]
    fn debug_redacts_password() {
        let printed = format!("{:?}", complete());
        assert!(printed.contains("[REDACTED]"));
        assert!(!printed.contains("dbz"));
    }

    #[test]
    fn from_debezium_properties() {
        let config = ConnectorConfiguration::from_properties([
            ("connector.class", "io.debezium.connector.mysql.MySqlConnector"),
            ("database.hostname", "db"),
            ("database.port", "3307"),
            ("database.user", "debezium"),
            ("database.password", "dbz"),
            ("database.include.list", "inventory, customers,"),
        ])
        .unwrap();

        assert_eq!(
            config.connector_class(),
            Some("io.debezium.connector.mysql.MySqlConnector")
        );
        assert_eq!(config.port(), Some(3307));
        assert_eq!(config.password(), Some("dbz"));
        assert_eq!(
            config.list("database.include.list"),
            vec!["inventory".to_string(), "customers".to_string()]
        );
        assert!(config.validate().is_ok());

        let err = ConnectorConfiguration::from_properties([("database.port", "abc")]).unwrap_err();
        assert!(matches!(err, SourceError::Configuration(_)));
    }

    #[test]
    fn typed_properties() {
        let config = complete()
            .with_connection_property("database.server.id", "184054")
            .with_connection_property("include.schema.changes", "false")
            .with_connection_property("broken", "x1");

        assert_eq!(
            config.parse_property::<u32>("database.server.id").unwrap(),
            Some(184054)
        );
        assert!(!config.flag("include.schema.changes", true).unwrap());
        assert!(config.flag("missing", true).unwrap());
        assert!(config.parse_property::<u32>("broken").is_err());
        assert!(config.list("missing").is_empty());
    }
}
