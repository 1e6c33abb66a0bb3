pub mod printer;

use std::path::PathBuf;
use std::sync::Arc;

use cdc_bridge::checkpoints::FileOffsetStore;
use cdc_bridge::config::ConnectorConfiguration;
use cdc_bridge::mapper::JsonValueMapper;
use cdc_bridge::mysql::{
    CONNECTOR_NAME, DATABASE_INCLUDE_LIST_KEY, SERVER_ID_KEY, SERVER_NAME_KEY,
};
use cdc_bridge::source_reader::{ReadOutcome, SourceReaderBuilder};
use clap::Parser;

use crate::printer::RecordPrinter;

#[derive(Parser)]
struct Args {
    /// Address of the MySQL server
    #[clap(long, action = clap::ArgAction::Set)]
    hostname: String,

    /// Port of the MySQL server
    #[clap(short, long, default_value_t = 3306, action = clap::ArgAction::Set)]
    port: u16,

    /// User with replication privileges
    #[clap(short, long, default_value = "root", action = clap::ArgAction::Set)]
    username: String,

    #[clap(long, action = clap::ArgAction::Set)]
    password: Option<String>,

    /// Replication client id, unique among the server's replicas
    #[clap(long, action = clap::ArgAction::Set)]
    server_id: u32,

    /// Logical server name used in record metadata and offsets
    #[clap(long, action = clap::ArgAction::Set)]
    server_name: Option<String>,

    /// Comma-separated databases to capture
    #[clap(long, value_delimiter = ',')]
    include_databases: Vec<String>,

    /// Extra connector property as key=value, may be repeated
    #[clap(long = "property", value_parser = parse_property)]
    properties: Vec<(String, String)>,

    /// Stop after printing this many records
    #[clap(long, action = clap::ArgAction::Set)]
    max_records: Option<u64>,

    /// Directory offsets are saved to; progress is kept in memory if not set
    #[clap(long, action = clap::ArgAction::Set)]
    offset_dir: Option<PathBuf>,

    /// Name offsets are saved under
    #[clap(long, default_value = "cdc-bridge-printer", action = clap::ArgAction::Set)]
    stream_id: String,
}

impl Args {
    fn configuration(&self) -> ConnectorConfiguration {
        let mut config = ConnectorConfiguration::create()
            .with_connector_class(CONNECTOR_NAME)
            .with_host_name(&self.hostname)
            .with_port(self.port)
            .with_username(&self.username)
            .with_connection_property(SERVER_ID_KEY, self.server_id.to_string());
        if let Some(password) = &self.password {
            config = config.with_password(password);
        }
        if let Some(server_name) = &self.server_name {
            config = config.with_connection_property(SERVER_NAME_KEY, server_name);
        }
        if !self.include_databases.is_empty() {
            config = config
                .with_connection_property(DATABASE_INCLUDE_LIST_KEY, self.include_databases.join(","));
        }
        for (key, value) in &self.properties {
            config = config.with_connection_property(key, value);
        }
        config
    }
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut builder = SourceReaderBuilder::new()
        .stream_id(&args.stream_id)
        .configuration(args.configuration())
        .mapper(JsonValueMapper);
    if let Some(max_records) = args.max_records {
        builder = builder.max_records(max_records);
    }
    if let Some(dir) = &args.offset_dir {
        builder = builder.offset_store(Arc::new(FileOffsetStore::new(dir).await?));
    }

    let mut reader = builder.build()?;
    reader.open().await?;

    let close = reader.close_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Shutting down...");
            close.close();
        }
    });

    let mut printer = RecordPrinter::new(std::io::stdout());
    loop {
        match reader.next().await? {
            ReadOutcome::Record(record) => printer.print(&record)?,
            ReadOutcome::Pending => continue,
            ReadOutcome::EndOfStream => break,
        }
    }
    reader.close().await?;

    Ok(())
}
