//! `livequery` - subscribe to one live query and print what happens.
//!
//! Every subscription event and client event is written to stdout as one
//! JSON line. Logs go to stderr (`RUST_LOG`, default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use livequery::protocol::JsonObject;
use livequery::{ClientConfig, LiveQueryClient, Query, StaticSessionToken};

#[derive(Parser, Debug)]
#[command(name = "livequery")]
#[command(version)]
#[command(about = "Subscribe to a live query and print events as JSON lines")]
struct Cli {
    /// Base HTTP(S) URL of the server; the WebSocket endpoint is derived from it
    #[arg(long)]
    server_url: Option<String>,

    /// Explicit ws:// or wss:// endpoint
    #[arg(long)]
    url: Option<String>,

    /// Application id sent with connect
    #[arg(long)]
    application_id: Option<String>,

    /// Client key sent with connect
    #[arg(long)]
    client_key: Option<String>,

    /// Session token of the user to subscribe as
    #[arg(long)]
    session_token: Option<String>,

    /// Class to watch
    #[arg(long)]
    class_name: String,

    /// Where-clause as a JSON object
    #[arg(long = "where", default_value = "{}")]
    where_clause: String,

    /// Comma separated field selection
    #[arg(long, value_delimiter = ',')]
    fields: Option<Vec<String>>,

    /// JSON config file (environment variables still override it)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load_from_file(path)?,
            None => ClientConfig::from_env(),
        };
        if let Some(server_url) = &self.server_url {
            config.server_url = Some(server_url.clone());
        }
        if let Some(url) = &self.url {
            config.live_query_url = Some(url.clone());
        }
        if let Some(application_id) = &self.application_id {
            config.application_id = application_id.clone();
        }
        if let Some(client_key) = &self.client_key {
            config.client_key = Some(client_key.clone());
        }
        Ok(config)
    }

    fn query(&self) -> Result<Query> {
        let where_clause: JsonObject = serde_json::from_str(&self.where_clause)
            .context("--where must be a JSON object")?;
        let mut query = Query::new(self.class_name.clone()).with_where(where_clause);
        if let Some(fields) = &self.fields {
            query = query.select(fields.iter().cloned());
        }
        Ok(query)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.client_config()?;
    let query = cli.query()?;

    let client = LiveQueryClient::builder()
        .config(config)
        .session_provider(Arc::new(StaticSessionToken::new(cli.session_token.clone())))
        .build()
        .context("Failed to configure client")?;
    log::info!("Subscribing to {} on {}", cli.class_name, client.endpoint());

    let mut client_events = client.events();
    let mut client_errors = client.errors();
    let subscription = client.subscribe(query)?;
    let mut events = subscription.events();
    let mut errors = subscription.errors();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, disconnecting");
                client.shutdown().await;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_line(&json!({
                    "type": "event",
                    "kind": event.kind,
                    "object": object_json(&event.object),
                    "original": event.original.as_ref().map(object_json),
                })),
                Err(RecvError::Lagged(skipped)) => log::warn!("Dropped {skipped} events"),
                Err(RecvError::Closed) => break,
            },
            error = errors.recv() => if let Ok(error) = error {
                print_line(&json!({"type": "subscription_error", "error": error.to_string()}));
            },
            event = client_events.recv() => if let Ok(event) = event {
                print_line(&json!({"type": "client", "event": event}));
            },
            error = client_errors.recv() => if let Ok(error) = error {
                print_line(&json!({"type": "error", "error": error.to_string()}));
            },
        }
    }

    Ok(())
}

fn object_json(object: &livequery::ObjectState) -> Value {
    let mut fields = object.attributes.clone();
    if let Some(class_name) = &object.class_name {
        fields.insert("className".to_string(), json!(class_name));
    }
    if let Some(object_id) = &object.object_id {
        fields.insert("objectId".to_string(), json!(object_id));
    }
    if let Some(created_at) = &object.created_at {
        fields.insert("createdAt".to_string(), json!(created_at));
    }
    if let Some(updated_at) = &object.updated_at {
        fields.insert("updatedAt".to_string(), json!(updated_at));
    }
    Value::Object(fields)
}

fn print_line(value: &Value) {
    println!("{value}");
}
