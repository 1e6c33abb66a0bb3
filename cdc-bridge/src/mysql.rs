//! MySQL binlog connector.
//!
//! Reads an optional snapshot of the captured tables and then streams
//! row-based binlog events through `mysql_async`. The server must run with
//! `binlog_format=ROW` and the user needs the `REPLICATION SLAVE` and
//! `REPLICATION CLIENT` privileges.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use futures::StreamExt;
use itertools::Itertools;
use mysql_async::binlog::events::{Event, EventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, OptsBuilder, Row, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cdc_types::{
    ChangeEvent, ColumnValue, RowImage, SourceMetadata, SourceOffset, SourcePartition,
};
use crate::checkpoints::OffsetMap;
use crate::config::ConnectorConfiguration;
use crate::connector::{Connector, ConnectorFactory};
use crate::consumer::{raised, Consumer};
use crate::error::SourceError;

pub const CONNECTOR_NAME: &str = "mysql";
pub const DEBEZIUM_CONNECTOR_CLASS: &str = "io.debezium.connector.mysql.MySqlConnector";

pub const SERVER_ID_KEY: &str = "database.server.id";
pub const SERVER_NAME_KEY: &str = "database.server.name";
pub const DATABASE_INCLUDE_LIST_KEY: &str = "database.include.list";
pub const TABLE_INCLUDE_LIST_KEY: &str = "table.include.list";
pub const INCLUDE_SCHEMA_CHANGES_KEY: &str = "include.schema.changes";
pub const SNAPSHOT_MODE_KEY: &str = "snapshot.mode";

const DEFAULT_PORT: u16 = 3306;
const SYSTEM_SCHEMAS: [&str; 4] = ["mysql", "information_schema", "performance_schema", "sys"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotMode {
    /// Read the captured tables before streaming, unless an offset exists.
    #[default]
    Initial,
    /// Stream from the current binlog position only.
    Never,
}

impl FromStr for SnapshotMode {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initial" => Ok(SnapshotMode::Initial),
            "never" => Ok(SnapshotMode::Never),
            other => Err(SourceError::configuration(format!(
                "unsupported {SNAPSHOT_MODE_KEY}: {other:?}"
            ))),
        }
    }
}

/// Connection and capture settings extracted from a [`ConnectorConfiguration`].
#[derive(Clone, PartialEq, Eq)]
pub struct MySqlSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub server_id: u32,
    pub server_name: String,
    pub databases: Vec<String>,
    pub tables: Vec<String>,
    pub include_schema_changes: bool,
    pub snapshot_mode: SnapshotMode,
}

impl fmt::Debug for MySqlSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("server_id", &self.server_id)
            .field("server_name", &self.server_name)
            .field("databases", &self.databases)
            .field("tables", &self.tables)
            .field("snapshot_mode", &self.snapshot_mode)
            .finish()
    }
}

impl MySqlSettings {
    pub fn from_config(config: &ConnectorConfiguration) -> Result<MySqlSettings, SourceError> {
        let host = config
            .host_name()
            .ok_or_else(|| SourceError::configuration("host name is required"))?
            .to_string();
        let server_id = config
            .parse_property::<u32>(SERVER_ID_KEY)?
            .ok_or_else(|| SourceError::configuration(format!("{SERVER_ID_KEY} is required")))?;
        let snapshot_mode = config
            .parse_property::<SnapshotMode>(SNAPSHOT_MODE_KEY)?
            .unwrap_or_default();

        Ok(MySqlSettings {
            server_name: config
                .property(SERVER_NAME_KEY)
                .map(str::to_string)
                .unwrap_or_else(|| host.clone()),
            host,
            port: config.port().unwrap_or(DEFAULT_PORT),
            user: config.username().map(str::to_string),
            password: config.password().map(str::to_string),
            server_id,
            databases: config.list(DATABASE_INCLUDE_LIST_KEY),
            tables: config.list(TABLE_INCLUDE_LIST_KEY),
            include_schema_changes: config.flag(INCLUDE_SCHEMA_CHANGES_KEY, false)?,
            snapshot_mode,
        })
    }

    fn opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(self.user.clone())
            .pass(self.password.clone())
            .into()
    }

    pub fn partition(&self) -> SourcePartition {
        SourcePartition::new(format!("server={}", self.server_name))
    }

    /// Whether changes of `database.table` are emitted.
    pub fn captures(&self, database: &str, table: &str) -> bool {
        if SYSTEM_SCHEMAS.contains(&database) {
            return false;
        }
        if !self.databases.is_empty() && !self.databases.iter().any(|db| db == database) {
            return false;
        }
        self.tables.is_empty()
            || self
                .tables
                .iter()
                .any(|qualified| *qualified == format!("{database}.{table}"))
    }

    fn metadata(&self, database: &str, schema: &str, table: &str) -> SourceMetadata {
        SourceMetadata {
            connector: CONNECTOR_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            name: self.server_name.clone(),
            database: database.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }
}

/// A position in the binlog: the start of a table-map group
/// and the number of its rows already delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BinlogPosition {
    file: String,
    pos: u64,
    row: u64,
}

impl BinlogPosition {
    fn from_offset(offset: &SourceOffset) -> Option<(BinlogPosition, bool)> {
        let position = BinlogPosition {
            file: offset.get_str("file")?.to_string(),
            pos: offset.get_u64("pos")?,
            row: offset.get_u64("row").unwrap_or(0),
        };
        Some((position, offset.get_bool("snapshot").unwrap_or(false)))
    }

    fn to_offset(&self, snapshot: bool) -> SourceOffset {
        SourceOffset::new()
            .with("file", self.file.clone())
            .with("pos", self.pos)
            .with("row", self.row)
            .with("snapshot", snapshot)
    }
}

pub struct MySqlConnectorFactory;

#[async_trait]
impl ConnectorFactory for MySqlConnectorFactory {
    async fn new_connector(
        &self,
        config: &ConnectorConfiguration,
    ) -> anyhow::Result<Box<dyn Connector>> {
        let settings = MySqlSettings::from_config(config)?;
        debug!("Creating MySQL connector: {:?}", settings);
        Ok(Box::new(MySqlConnector::new(settings)))
    }
}

pub struct MySqlConnector {
    settings: MySqlSettings,
    metadata_conn: Option<Conn>,
    position: Option<BinlogPosition>,
    snapshot_pending: bool,
    columns: HashMap<(String, String), Vec<String>>,
}

impl MySqlConnector {
    pub fn new(settings: MySqlSettings) -> MySqlConnector {
        MySqlConnector {
            settings,
            metadata_conn: None,
            position: None,
            snapshot_pending: false,
            columns: HashMap::new(),
        }
    }

    async fn metadata_conn(&mut self) -> anyhow::Result<&mut Conn> {
        if self.metadata_conn.is_none() {
            let conn = Conn::new(self.settings.opts()).await.with_context(|| {
                format!(
                    "failed to connect to MySQL at {}:{}",
                    self.settings.host, self.settings.port
                )
            })?;
            self.metadata_conn = Some(conn);
        }
        self.metadata_conn
            .as_mut()
            .ok_or_else(|| anyhow!("metadata connection unavailable"))
    }

    async fn captured_tables(&mut self) -> anyhow::Result<Vec<(String, String)>> {
        let query = format!(
            "SELECT TABLE_SCHEMA, TABLE_NAME FROM information_schema.TABLES \
             WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA NOT IN ({}) \
             ORDER BY TABLE_SCHEMA, TABLE_NAME",
            SYSTEM_SCHEMAS.iter().map(|schema| format!("'{schema}'")).join(", ")
        );
        let tables: Vec<(String, String)> = self
            .metadata_conn()
            .await?
            .query(query)
            .await
            .context("failed to list tables")?;

        Ok(tables
            .into_iter()
            .filter(|(database, table)| self.settings.captures(database, table))
            .collect())
    }

    async fn load_columns(&mut self, database: &str, table: &str) -> anyhow::Result<()> {
        let key = (database.to_string(), table.to_string());
        if self.columns.contains_key(&key) {
            return Ok(());
        }

        let names: Vec<String> = self
            .metadata_conn()
            .await?
            .exec(
                "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await
            .with_context(|| format!("failed to read columns of {database}.{table}"))?;
        debug!("Columns of {}.{}: {:?}", database, table, names);
        self.columns.insert(key, names);
        Ok(())
    }

    fn image(&self, database: &str, table: &str, values: Vec<ColumnValue>) -> RowImage {
        let names = self
            .columns
            .get(&(database.to_string(), table.to_string()));
        values
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                let name = names
                    .and_then(|names| names.get(i))
                    .cloned()
                    .unwrap_or_else(|| format!("col_{i}"));
                (name, value)
            })
            .collect()
    }

    /// Emits every row of the captured tables as a snapshot read.
    /// Returns `false` if stopped before finishing.
    async fn snapshot(
        &mut self,
        consumer: &mut dyn Consumer,
        stop: &watch::Receiver<bool>,
        head: &BinlogPosition,
    ) -> anyhow::Result<bool> {
        let tables = self.captured_tables().await?;
        info!(
            "Snapshotting {} tables at {}:{}",
            tables.len(),
            head.file,
            head.pos
        );
        let partition = self.settings.partition();

        for (table_idx, (database, table)) in tables.iter().enumerate() {
            let query = format!("SELECT * FROM {}.{}", quote_ident(database), quote_ident(table));
            // Binary protocol, so numbers keep their types.
            let rows: Vec<Row> = self
                .metadata_conn()
                .await?
                .exec(query.as_str(), ())
                .await
                .with_context(|| format!("failed to snapshot {database}.{table}"))?;
            debug!("Snapshot of {}.{}: {} rows", database, table, rows.len());

            let last_table = table_idx + 1 == tables.len();
            let row_count = rows.len();
            for (row_idx, row) in rows.into_iter().enumerate() {
                if *stop.borrow() {
                    return Ok(false);
                }
                let finished = last_table && row_idx + 1 == row_count;
                let image: RowImage = row
                    .columns_ref()
                    .iter()
                    .enumerate()
                    .map(|(i, column)| {
                        let value = row.as_ref(i).cloned().unwrap_or(Value::NULL);
                        (column.name_str().into_owned(), column_value(value))
                    })
                    .collect();

                let event = ChangeEvent::read(
                    partition.clone(),
                    head.to_offset(!finished),
                    self.settings.metadata(database, &head.file, table),
                    image,
                );
                consumer.consume_cdc(event).await?;
            }
        }

        info!("Snapshot finished");
        Ok(true)
    }

    async fn stream_binlog(
        &mut self,
        consumer: &mut dyn Consumer,
        mut stop: watch::Receiver<bool>,
        start: BinlogPosition,
    ) -> anyhow::Result<()> {
        info!(
            "Streaming binlog from {}:{} (skipping {} rows)",
            start.file, start.pos, start.row
        );
        let request = BinlogStreamRequest::new(self.settings.server_id)
            .with_filename(start.file.as_bytes())
            .with_pos(start.pos);
        let stream = Conn::new(self.settings.opts())
            .await
            .context("failed to open binlog connection")?
            .get_binlog_stream(request)
            .await
            .context("failed to request binlog stream")?;
        let mut stream = Box::pin(stream);

        let partition = self.settings.partition();
        let mut tracker = RowTracker::new(&start);

        loop {
            let next = tokio::select! {
                biased;
                _ = raised(&mut stop) => return Ok(()),
                event = stream.next() => event,
            };
            let (step, log_pos, timestamp) = {
                let event = match next {
                    Some(event) => event.context("failed to read binlog event")?,
                    None => bail!("binlog stream closed by the server"),
                };
                let timestamp = Utc
                    .timestamp_opt(i64::from(event.header().timestamp()), 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                (
                    decode(&stream, &event)?,
                    u64::from(event.header().log_pos()),
                    timestamp,
                )
            };

            match step {
                Step::Rotate { next_file, pos } => {
                    debug!("Binlog rotated to {}:{}", next_file, pos);
                    tracker.rotate(next_file, pos);
                    continue;
                }
                Step::TableMap { database, table } => {
                    tracker.table_map();
                    if self.settings.captures(&database, &table) {
                        self.load_columns(&database, &table).await?;
                    }
                }
                Step::Rows {
                    database,
                    table,
                    images,
                } => {
                    let captured = self.settings.captures(&database, &table);
                    for (before, after) in images {
                        let Some(position) = tracker.row() else {
                            continue;
                        };
                        if !captured {
                            continue;
                        }

                        let metadata = self.settings.metadata(&database, &position.file, &table);
                        let before = before.map(|values| self.image(&database, &table, values));
                        let after = after.map(|values| self.image(&database, &table, values));
                        let offset = position.to_offset(false);

                        let event = match (before, after) {
                            (None, Some(after)) => {
                                ChangeEvent::insert(partition.clone(), offset, metadata, after)
                            }
                            (Some(before), Some(after)) => ChangeEvent::update(
                                partition.clone(),
                                offset,
                                metadata,
                                before,
                                after,
                            ),
                            (Some(before), None) => {
                                ChangeEvent::delete(partition.clone(), offset, metadata, before)
                            }
                            (None, None) => continue,
                        };
                        consumer.consume_cdc(event.at(timestamp)).await?;
                    }
                }
                Step::Query(query) => {
                    tracker.boundary();
                    if is_schema_change(&query) {
                        debug!("Schema change, dropping cached columns: {}", query);
                        self.columns.clear();
                    }
                }
                Step::Other => tracker.boundary(),
            }

            tracker.advance(log_pos);
        }
    }
}

/// Assigns binlog positions to row events.
///
/// Rows are numbered within their table-map group (consecutive table maps
/// followed by their rows events), and a group is addressed by the position
/// of its first table map, which is where a resumed stream has to restart.
/// Rows of the resumed group that were already delivered are skipped.
#[derive(Debug)]
struct RowTracker {
    file: String,
    current_pos: u64,
    resume_skip: Option<(u64, u64)>,
    group_start: Option<u64>,
    last_was_rows: bool,
    row_in_group: u64,
}

impl RowTracker {
    fn new(start: &BinlogPosition) -> RowTracker {
        RowTracker {
            file: start.file.clone(),
            current_pos: start.pos,
            resume_skip: Some((start.pos, start.row)).filter(|(_, rows)| *rows > 0),
            group_start: None,
            last_was_rows: false,
            row_in_group: 0,
        }
    }

    fn rotate(&mut self, file: String, pos: u64) {
        self.file = file;
        self.current_pos = pos;
        self.group_start = None;
        self.last_was_rows = false;
    }

    fn table_map(&mut self) {
        if self.group_start.is_none() || self.last_was_rows {
            self.group_start = Some(self.current_pos);
            self.row_in_group = 0;
            let current = self.current_pos;
            if self.resume_skip.is_some_and(|(pos, _)| pos != current) {
                self.resume_skip = None;
            }
        }
        self.last_was_rows = false;
    }

    /// Position of the next row of the current rows event, or `None` when a
    /// resume already delivered it.
    fn row(&mut self) -> Option<BinlogPosition> {
        self.last_was_rows = true;
        let group = self.group_start.unwrap_or(self.current_pos);
        self.row_in_group += 1;
        let row = self.row_in_group;
        if self.resume_skip.is_some_and(|(pos, rows)| pos == group && row <= rows) {
            return None;
        }
        Some(BinlogPosition {
            file: self.file.clone(),
            pos: group,
            row,
        })
    }

    fn boundary(&mut self) {
        self.group_start = None;
        self.last_was_rows = false;
    }

    /// Moves past the current event. `log_pos` is the end position from its header.
    fn advance(&mut self, log_pos: u64) {
        if log_pos != 0 {
            self.current_pos = log_pos;
        }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&mut self, resume: &OffsetMap) -> anyhow::Result<()> {
        let partition = self.settings.partition();
        let stored = resume
            .get(&partition)
            .and_then(|record| BinlogPosition::from_offset(&record.offset));

        match stored {
            Some((position, false)) => {
                info!("Resuming {} from {}:{}", partition, position.file, position.pos);
                self.metadata_conn().await?;
                self.position = Some(position);
                self.snapshot_pending = false;
            }
            stored => {
                if stored.is_some() {
                    info!("Previous snapshot of {} did not finish, starting over", partition);
                }
                let head = binlog_head(self.metadata_conn().await?).await?;
                self.snapshot_pending = self.settings.snapshot_mode == SnapshotMode::Initial;
                self.position = Some(head);
            }
        }

        if self.settings.include_schema_changes {
            warn!("Schema change events are not emitted, only row changes");
        }
        Ok(())
    }

    async fn run(
        &mut self,
        consumer: &mut dyn Consumer,
        stop: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let position = self
            .position
            .clone()
            .ok_or_else(|| anyhow!("connector was not connected"))?;

        if self.snapshot_pending {
            if !self.snapshot(consumer, &stop, &position).await? {
                return Ok(());
            }
            self.snapshot_pending = false;
        }
        if *stop.borrow() {
            return Ok(());
        }

        let result = self.stream_binlog(consumer, stop, position).await;
        if let Some(conn) = self.metadata_conn.take() {
            if let Err(e) = conn.disconnect().await {
                debug!("Failed to close metadata connection: {}", e);
            }
        }
        result
    }
}

/// Owned summary of a binlog event, so nothing borrowed from the stream
/// is held while events are handed over.
enum Step {
    Rotate {
        next_file: String,
        pos: u64,
    },
    TableMap {
        database: String,
        table: String,
    },
    Rows {
        database: String,
        table: String,
        images: Vec<(Option<Vec<ColumnValue>>, Option<Vec<ColumnValue>>)>,
    },
    Query(String),
    Other,
}

fn decode(stream: &BinlogStream, event: &Event) -> anyhow::Result<Step> {
    let Some(data) = event.read_data().context("malformed binlog event")? else {
        return Ok(Step::Other);
    };

    Ok(match data {
        EventData::RotateEvent(rotate) => Step::Rotate {
            next_file: rotate.name().into_owned(),
            pos: rotate.position(),
        },
        EventData::TableMapEvent(tme) => Step::TableMap {
            database: tme.database_name().into_owned(),
            table: tme.table_name().into_owned(),
        },
        EventData::QueryEvent(query) => Step::Query(query.query().into_owned()),
        EventData::RowsEvent(rows) => {
            let tme = stream
                .get_tme(rows.table_id())
                .ok_or_else(|| anyhow!("no table map for table id {}", rows.table_id()))?;
            let mut images = vec![];
            for row in rows.rows(tme) {
                let (before, after) = row.context("malformed rows event")?;
                images.push((before.map(row_values), after.map(row_values)));
            }
            Step::Rows {
                database: tme.database_name().into_owned(),
                table: tme.table_name().into_owned(),
                images,
            }
        }
        _ => Step::Other,
    })
}

fn row_values(row: BinlogRow) -> Vec<ColumnValue> {
    (0..row.len())
        .map(|i| match row.as_ref(i) {
            Some(BinlogValue::Value(value)) => column_value(value.clone()),
            Some(other) => ColumnValue::Text(format!("{other:?}")),
            None => ColumnValue::Null,
        })
        .collect()
}

async fn binlog_head(conn: &mut Conn) -> anyhow::Result<BinlogPosition> {
    // MySQL 8.4 removed SHOW MASTER STATUS.
    let rows: Vec<Row> = match conn.query("SHOW BINARY LOG STATUS").await {
        Ok(rows) => rows,
        Err(_) => conn
            .query("SHOW MASTER STATUS")
            .await
            .context("failed to read the binlog position")?,
    };
    let row = rows
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("binary logging is disabled on the server"))?;

    Ok(BinlogPosition {
        file: row
            .get::<String, usize>(0)
            .ok_or_else(|| anyhow!("binlog status without a file name"))?,
        pos: row
            .get::<u64, usize>(1)
            .ok_or_else(|| anyhow!("binlog status without a position"))?,
        row: 0,
    })
}

fn column_value(value: Value) -> ColumnValue {
    match value {
        Value::NULL => ColumnValue::Null,
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => ColumnValue::Text(text),
            Err(e) => ColumnValue::Bytes(e.into_bytes()),
        },
        Value::Int(i) => ColumnValue::Int(i),
        Value::UInt(u) => ColumnValue::UInt(u),
        Value::Float(f) => ColumnValue::Float(f64::from(f)),
        Value::Double(d) => ColumnValue::Float(d),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            ColumnValue::Text(render_date(year, month, day, hour, minute, second, micros))
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let hours = u64::from(days) * 24 + u64::from(hours);
            let sign = if negative { "-" } else { "" };
            let mut time = format!("{sign}{hours:02}:{minutes:02}:{seconds:02}");
            if micros != 0 {
                time.push_str(&format!(".{micros:06}"));
            }
            ColumnValue::Text(time)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn render_date(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8, micros: u32) -> String {
    let date = NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day));
    let time_of_day = (hour, minute, second, micros) != (0, 0, 0, 0);

    match date {
        Some(date) if !time_of_day => date.format("%Y-%m-%d").to_string(),
        Some(date) => date
            .and_hms_micro_opt(u32::from(hour), u32::from(minute), u32::from(second), micros)
            .map(|datetime| datetime.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            .unwrap_or_else(|| date.format("%Y-%m-%d").to_string()),
        // Zero dates are legal in MySQL but not in chrono.
        None => format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
        ),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

fn is_schema_change(query: &str) -> bool {
    let statement = query.trim_start().to_ascii_uppercase();
    ["ALTER", "CREATE", "DROP", "RENAME", "TRUNCATE"]
        .iter()
        .any(|keyword| statement.starts_with(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc_types::OffsetRecord;

    fn config() -> ConnectorConfiguration {
        ConnectorConfiguration::create()
            .with_connector_class(DEBEZIUM_CONNECTOR_CLASS)
            .with_host_name("mysql")
            .with_port(3306)
            .with_username("debezium")
            .with_password("dbz")
            .with_connection_property(SERVER_ID_KEY, "184054")
    }

    #[test]
    fn settings_from_configuration() {
        let settings = MySqlSettings::from_config(
            &config()
                .with_connection_property(SERVER_NAME_KEY, "dbserver1")
                .with_connection_property(DATABASE_INCLUDE_LIST_KEY, "inventory")
                .with_connection_property(SNAPSHOT_MODE_KEY, "never"),
        )
        .unwrap();

        assert_eq!(settings.server_id, 184054);
        assert_eq!(settings.server_name, "dbserver1");
        assert_eq!(settings.partition(), SourcePartition::new("server=dbserver1"));
        assert_eq!(settings.snapshot_mode, SnapshotMode::Never);
        assert!(!format!("{settings:?}").contains("dbz"));

        let defaults = MySqlSettings::from_config(&config()).unwrap();
        assert_eq!(defaults.server_name, "mysql");
        assert_eq!(defaults.snapshot_mode, SnapshotMode::Initial);
    }

    #[test]
    fn settings_require_server_id() {
        let config = ConnectorConfiguration::create()
            .with_connector_class(CONNECTOR_NAME)
            .with_host_name("mysql")
            .with_port(3306);
        assert!(matches!(
            MySqlSettings::from_config(&config),
            Err(SourceError::Configuration(msg)) if msg.contains(SERVER_ID_KEY)
        ));
        assert!(MySqlSettings::from_config(
            &config
                .clone()
                .with_connection_property(SERVER_ID_KEY, "x")
        )
        .is_err());
        assert!(MySqlSettings::from_config(
            &config
                .with_connection_property(SERVER_ID_KEY, "1")
                .with_connection_property(SNAPSHOT_MODE_KEY, "sometimes")
        )
        .is_err());
    }

    #[test]
    fn capture_filters() {
        let settings = MySqlSettings::from_config(
            &config()
                .with_connection_property(DATABASE_INCLUDE_LIST_KEY, "inventory,crm")
                .with_connection_property(TABLE_INCLUDE_LIST_KEY, "inventory.addresses, crm.leads"),
        )
        .unwrap();

        assert!(settings.captures("inventory", "addresses"));
        assert!(settings.captures("crm", "leads"));
        assert!(!settings.captures("inventory", "orders"));
        assert!(!settings.captures("billing", "addresses"));

        let everything = MySqlSettings::from_config(&config()).unwrap();
        assert!(everything.captures("inventory", "orders"));
        assert!(!everything.captures("mysql", "user"));
        assert!(!everything.captures("performance_schema", "threads"));
    }

    #[test]
    fn binlog_offsets() {
        let position = BinlogPosition {
            file: "mysql-bin.000003".to_string(),
            pos: 154,
            row: 2,
        };
        let offset = position.to_offset(false);
        assert_eq!(
            offset.to_string(),
            "file=\"mysql-bin.000003\", pos=154, row=2, snapshot=false"
        );
        assert_eq!(BinlogPosition::from_offset(&offset), Some((position, false)));
        assert_eq!(BinlogPosition::from_offset(&SourceOffset::new().with("pos", 4u64)), None);

        let record = OffsetRecord::new(SourcePartition::new("server=a"), offset);
        let json = serde_json::to_string(&record).unwrap();
        let back: OffsetRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    fn at(file: &str, pos: u64, row: u64) -> BinlogPosition {
        BinlogPosition {
            file: file.to_string(),
            pos,
            row,
        }
    }

    #[test]
    fn resume_skips_delivered_rows_of_group() {
        let mut tracker = RowTracker::new(&at("mysql-bin.000003", 100, 2));
        tracker.table_map();
        tracker.advance(150);

        assert_eq!(tracker.row(), None);
        assert_eq!(tracker.row(), None);
        assert_eq!(tracker.row(), Some(at("mysql-bin.000003", 100, 3)));
        tracker.advance(300);

        // The next transaction is a new group, nothing is skipped anymore.
        tracker.boundary();
        tracker.advance(380);
        tracker.table_map();
        tracker.advance(430);
        assert_eq!(tracker.row(), Some(at("mysql-bin.000003", 380, 1)));
    }

    #[test]
    fn rows_of_one_group_share_its_position() {
        let mut tracker = RowTracker::new(&at("mysql-bin.000001", 4, 0));
        // A statement touching two tables: both table maps precede the rows.
        tracker.table_map();
        tracker.advance(50);
        tracker.table_map();
        tracker.advance(100);
        assert_eq!(tracker.row(), Some(at("mysql-bin.000001", 4, 1)));
        tracker.advance(150);
        assert_eq!(tracker.row(), Some(at("mysql-bin.000001", 4, 2)));
        tracker.advance(200);

        // A table map after rows opens the next group.
        tracker.table_map();
        tracker.advance(250);
        assert_eq!(tracker.row(), Some(at("mysql-bin.000001", 200, 1)));
    }

    #[test]
    fn rotate_switches_file() {
        let mut tracker = RowTracker::new(&at("mysql-bin.000001", 4, 0));
        tracker.table_map();
        tracker.advance(60);
        assert_eq!(tracker.row(), Some(at("mysql-bin.000001", 4, 1)));
        tracker.advance(120);

        tracker.rotate("mysql-bin.000002".to_string(), 4);
        tracker.table_map();
        tracker.advance(60);
        assert_eq!(tracker.row(), Some(at("mysql-bin.000002", 4, 1)));
    }

    #[test]
    fn stale_resume_position_skips_nothing() {
        let mut tracker = RowTracker::new(&at("mysql-bin.000003", 100, 2));
        tracker.boundary();
        tracker.advance(120);
        tracker.table_map();
        tracker.advance(170);

        assert_eq!(tracker.row(), Some(at("mysql-bin.000003", 120, 1)));
        assert_eq!(tracker.row(), Some(at("mysql-bin.000003", 120, 2)));
    }

    #[test]
    fn unchanged_log_pos_keeps_position() {
        let mut tracker = RowTracker::new(&at("mysql-bin.000001", 4, 0));
        tracker.advance(0);
        tracker.table_map();
        assert_eq!(tracker.row(), Some(at("mysql-bin.000001", 4, 1)));
    }

    #[test]
    fn column_values() {
        assert_eq!(column_value(Value::NULL), ColumnValue::Null);
        assert_eq!(
            column_value(Value::Bytes(b"Euless".to_vec())),
            ColumnValue::Text("Euless".to_string())
        );
        assert_eq!(
            column_value(Value::Bytes(vec![0xff, 0x00])),
            ColumnValue::Bytes(vec![0xff, 0x00])
        );
        assert_eq!(column_value(Value::Int(-3)), ColumnValue::Int(-3));
        assert_eq!(column_value(Value::UInt(1001)), ColumnValue::UInt(1001));
        assert_eq!(column_value(Value::Double(0.25)), ColumnValue::Float(0.25));
        assert_eq!(
            column_value(Value::Date(2021, 3, 14, 0, 0, 0, 0)),
            ColumnValue::Text("2021-03-14".to_string())
        );
        assert_eq!(
            column_value(Value::Date(2021, 3, 14, 15, 9, 26, 500_000)),
            ColumnValue::Text("2021-03-14T15:09:26.500".to_string())
        );
        assert_eq!(
            column_value(Value::Date(0, 0, 0, 0, 0, 0, 0)),
            ColumnValue::Text("0000-00-00 00:00:00".to_string())
        );
        assert_eq!(
            column_value(Value::Time(true, 1, 2, 3, 4, 0)),
            ColumnValue::Text("-26:03:04".to_string())
        );
    }

    #[test]
    fn identifiers_and_statements() {
        assert_eq!(quote_ident("addresses"), "`addresses`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
        assert!(is_schema_change("  alter table addresses add column x int"));
        assert!(!is_schema_change("BEGIN"));
    }
}
