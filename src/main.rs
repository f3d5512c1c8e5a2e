mod cli;

use clap::Parser;
use cli::{Cli, Commands, ConsumeArgs, RepoCommand, WriteArgs};
use spoolbox::config::Config;
use spoolbox::consumer::{LoggingProcessor, Processor, RelayProcessor};
use spoolbox::expression::HeadersMap;
use spoolbox::idempotent::{FjallRepository, IdempotentRepository};
use spoolbox::observability::Metrics;
use spoolbox::writer::{FILE_NAME_HEADER, Payload};
use std::io::Read;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Consume(args) => consume(&config, args).await?,
        Commands::Write(args) => write(&config, args).await?,
        Commands::Repo(command) => repo(&config, command)?,
        Commands::Config => println!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

async fn consume(config: &Config, args: ConsumeArgs) -> Result<(), BoxError> {
    let metrics = Arc::new(Metrics::new());
    let consumer = config.consumer()?.with_metrics(Arc::clone(&metrics));

    let processor: Box<dyn Processor> = match args.output {
        Some(output) => {
            let mut target = config.producer.write_target()?;
            target.directory = output;
            target.file_name = None;
            let writer = Arc::new(config.writer().with_metrics(Arc::clone(&metrics)));
            Box::new(RelayProcessor::new(writer, target))
        }
        None => Box::new(LoggingProcessor),
    };

    if args.once {
        let report = consumer.poll_once(processor.as_ref()).await?;
        info!(?report, "Poll cycle finished");
    } else {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = tx.send(true);
        });
        consumer.run(processor.as_ref(), rx).await;
    }

    info!(metrics = %serde_json::to_string(&metrics.snapshot())?, "Consumer stopped");
    Ok(())
}

async fn write(config: &Config, args: WriteArgs) -> Result<(), BoxError> {
    let target = config.producer.write_target()?;
    let writer = config.writer();

    let name = args.name.or_else(|| {
        args.input
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    });
    let mut headers = HeadersMap::new();
    if let Some(name) = name {
        headers.insert(FILE_NAME_HEADER.to_string(), name);
    }

    let input = args.input;
    let result = tokio::task::spawn_blocking(move || -> Result<_, BoxError> {
        let reader: Box<dyn Read + Send> = match input {
            Some(path) => Box::new(std::fs::File::open(path)?),
            None => Box::new(std::io::stdin()),
        };
        Ok(writer.write(&target, Payload::Stream(reader), &headers)?)
    })
    .await??;

    info!(
        path = %result.path.display(),
        bytes = result.bytes_written,
        outcome = ?result.outcome,
        "File written"
    );
    Ok(())
}

fn repo(config: &Config, command: RepoCommand) -> Result<(), BoxError> {
    let repository = FjallRepository::open(&config.idempotent.path)?;
    match command {
        RepoCommand::List { limit } => {
            for entry in repository.entries(limit)? {
                println!("{}\t{}", entry.confirmed_at.to_rfc3339(), entry.key);
            }
        }
        RepoCommand::Evict { key } => {
            if repository.remove(&key)? {
                info!(key = %key, "Key evicted");
            } else {
                warn!(key = %key, "Key not present");
            }
        }
        RepoCommand::Clear => {
            repository.clear()?;
            info!("Repository cleared");
        }
    }
    repository.persist()?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
