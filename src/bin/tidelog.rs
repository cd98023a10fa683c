//! Command-line surface: serve a store over HTTP, dump a remote feed, or
//! replicate one into a local store.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use tidelog::{replicate, server, store, Streamer};

#[derive(Parser)]
#[command(name = "tidelog", version, about = "Append-only event store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provides HTTP access to an event store.
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1:4711")]
        bind: String,
        /// Data source name: a database file, or a directory with optional
        /// `?batch-size=&chunk-size=` options for a chunked store.
        dsn: String,
    },
    /// Copies a stream feed to stdout as JSON lines.
    Stream {
        /// Stream URL, e.g. http://127.0.0.1:4711/streams/$all
        url: String,
        /// Keep following the feed after reaching the head.
        #[arg(long)]
        follow: bool,
        /// Start at this stream version.
        #[arg(long, default_value_t = 0)]
        from: u64,
        /// Long-poll timeout in seconds while following.
        #[arg(long, default_value_t = 30)]
        poll_timeout: u64,
    },
    /// Replicates a remote $all feed into a local store.
    Replicate {
        /// Source feed URL.
        #[arg(long)]
        source: String,
        /// Target data source name.
        #[arg(long)]
        target: String,
        /// Keep following the source after catching up.
        #[arg(long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve { bind, dsn } => {
            let store = store::open(&dsn).with_context(|| format!("open store '{dsn}'"))?;
            server::serve(&bind, store).await?;
        }
        Command::Stream {
            url,
            follow,
            from,
            poll_timeout,
        } => {
            let mut streamer = Streamer::connect(&url)
                .from_version(from)
                .poll_timeout(Duration::from_secs(poll_timeout));
            if follow {
                streamer = streamer.follow();
            }
            let mut records = streamer.records();
            while let Some(record) = records.next().await {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Replicate {
            source,
            target,
            follow,
        } => {
            let store = store::open(&target).with_context(|| format!("open store '{target}'"))?;
            replicate::run(&source, store, follow).await?;
        }
    }
    Ok(())
}
