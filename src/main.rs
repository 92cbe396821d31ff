use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rabbit_hutch::config::load_config;
use rabbit_hutch::{
    ConnectionManager, ConnectionOptions, ConsumeOptions, Exchange, ExchangeOptions, HutchConfig,
    MemoryBroker, Message, NackOptions, Payload, PublishOptions, QueueOptions,
};

const REQUEST_KEY: &str = "hutch.requests";
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "rabbit-hutch", about = "Request/reply over RabbitMQ")]
struct Cli {
    /// Exchange the requests are published to
    #[arg(long, default_value = "hutch.rpc")]
    exchange: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer requests until interrupted
    Server,
    /// Send requests and print the replies
    Client {
        #[arg(long, default_value_t = 3)]
        count: u32,
    },
    /// Run server and client against the in-process broker
    Memory {
        #[arg(long, default_value_t = 3)]
        count: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    id: u32,
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Answer {
    id: u32,
    text: String,
    answered_at: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Server => {
            let manager = ConnectionManager::from_config(&settings()?)?;
            let exchange = manager.direct(Some(&cli.exchange), ExchangeOptions::default())?;
            serve(&exchange).await?;

            info!("Waiting for requests, press Ctrl+C to exit");
            tokio::signal::ctrl_c().await?;
            manager.close().await?;
        }
        Command::Client { count } => {
            let manager = ConnectionManager::from_config(&settings()?)?;
            let exchange = manager.direct(Some(&cli.exchange), ExchangeOptions::default())?;
            ask(&exchange, count).await?;
            manager.close().await?;
        }
        Command::Memory { count } => {
            let broker = MemoryBroker::new();
            let manager = ConnectionManager::with_connector(
                "memory://hutch",
                ConnectionOptions::default(),
                broker.connector(),
            )?;
            let exchange = manager.direct(Some(&cli.exchange), ExchangeOptions::default())?;
            serve(&exchange).await?;
            ask(&exchange, count).await?;
            manager.close().await?;
        }
    }

    Ok(())
}

/// `RabbitHutch.json` when present, otherwise the environment.
fn settings() -> anyhow::Result<HutchConfig> {
    match load_config() {
        Ok(config) => Ok(config),
        Err(e) => {
            info!("No config file ({}), reading AMQP_ADDR", e);
            HutchConfig::from_env().context("Failed to load configuration from the environment")
        }
    }
}

async fn serve(exchange: &Exchange) -> anyhow::Result<()> {
    let queue = exchange.queue(QueueOptions::named(REQUEST_KEY))?;
    let mut events = queue.subscribe();
    queue.consume(answer, ConsumeOptions::default()).await?;

    // wait for the binding so the first request is routed
    loop {
        match events.recv().await? {
            rabbit_hutch::QueueEvent::Bound => break,
            rabbit_hutch::QueueEvent::Close(cause) => {
                anyhow::bail!("Request queue closed before binding: {:?}", cause)
            }
            _ => {}
        }
    }
    info!(queue = %queue.name(), "Serving requests");
    Ok(())
}

async fn answer(message: Message) {
    let greeting: Greeting = match message.parse() {
        Ok(greeting) => greeting,
        Err(e) => {
            warn!("Unexpected request body: {}", e);
            let options = NackOptions {
                requeue: false,
                ..NackOptions::default()
            };
            if let Err(e) = message.nack(options).await {
                error!("Failed to reject request: {}", e);
            }
            return;
        }
    };

    let reply = Answer {
        id: greeting.id,
        text: format!("Hello back, {}", greeting.text),
        answered_at: Utc::now(),
    };
    let reply = match Payload::json(&reply) {
        Ok(reply) => reply,
        Err(e) => {
            error!("Failed to encode reply: {}", e);
            return;
        }
    };
    if let Err(e) = message.ack(Some(reply)).await {
        error!("Failed to answer request {}: {}", greeting.id, e);
    }
}

async fn ask(exchange: &Exchange, count: u32) -> anyhow::Result<()> {
    for id in 1..=count {
        let greeting = Greeting {
            id,
            text: format!("request {}", id),
        };
        let reply = exchange
            .request(Payload::json(&greeting)?, PublishOptions::routed(REQUEST_KEY))
            .await?;

        let answer: Answer = tokio::time::timeout(REPLY_TIMEOUT, reply)
            .await
            .context("No reply in time")??
            .parse()?;
        info!(id = answer.id, at = %answer.answered_at, "{}", answer.text);
    }
    Ok(())
}
