use anyhow::{bail, Context, Result};
use cask::cas::BlobContent;
use cask::collab::StaticAcl;
use cask::{
    CaskConfig, DeleteOptions, Ingestor, InputSpec, Permission, ReadMode, ReadOptions,
    RequestContext, SyncManifest, SyncOptions, WriteOptions,
};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

#[derive(Parser)]
#[command(name = "cask")]
#[command(about = "Content-addressed file store", long_about = None)]
#[command(version)]
struct Cli {
    /// Actor recorded on every request
    #[arg(long, global = true, env = "CASK_ACTOR", default_value = "local")]
    actor: String,

    /// Only grant the actor read access
    #[arg(long, global = true)]
    read_only: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store content at a catalog path
    Put {
        /// Catalog path, e.g. /datasets/2024/a.csv
        path: String,

        /// Local file to read, `-` for stdin, or a content address with --by-hash
        source: String,

        /// Overwrite an existing file
        #[arg(long)]
        replace: bool,

        /// Mime type override
        #[arg(long)]
        mime: Option<String>,

        /// Treat SOURCE as the address of an already stored blob
        #[arg(long)]
        by_hash: bool,
    },

    /// Read a file's content
    Get {
        path: String,

        /// Write to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Delete a file
    Rm {
        path: String,

        /// Keep the blob even when nothing references it
        #[arg(long)]
        soft: bool,
    },

    /// Show a file's catalog record
    Stat { path: String },

    /// Register paths against stored blobs from a JSON manifest
    Sync {
        manifest: PathBuf,

        #[arg(long)]
        replace: bool,
    },

    /// Delete every blob and catalog record
    Powerwash {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = CaskConfig::load().await.context("Failed to load configuration")?;
    let permission = if cli.read_only {
        Permission::Read
    } else {
        Permission::Write
    };
    let ingestor = Ingestor::open(config)
        .await
        .context("Failed to open store")?
        .with_access_gate(Arc::new(StaticAcl::new().grant(&cli.actor, "/", permission)));

    match cli.command {
        Commands::Put {
            path,
            source,
            replace,
            mime,
            by_hash,
        } => {
            let ctx = RequestContext::new(&cli.actor, &path);
            let mut opts = WriteOptions {
                replace,
                mime_type: mime,
                ..WriteOptions::default()
            };
            let input = if by_hash {
                InputSpec::from_hash(source)
            } else if source == "-" {
                InputSpec::from_stream(tokio::io::stdin())
            } else {
                let file = tokio::fs::canonicalize(&source)
                    .await
                    .with_context(|| format!("Cannot read {}", source))?;
                opts.source_path = Some(file.clone());
                InputSpec::from_path(file)
            };

            let outcome = ingestor
                .write(&ctx, input, opts)
                .await
                .with_context(|| format!("Failed to store {}", path))?;
            print_json(&outcome)
        }
        Commands::Get { path, out } => {
            let ctx = RequestContext::new(&cli.actor, &path);
            let content = ingestor
                .read(&ctx, ReadOptions { mode: ReadMode::Stream })
                .await
                .with_context(|| format!("Failed to read {}", path))?;
            let BlobContent::Stream(mut stream) = content else {
                bail!("expected a streamed read");
            };

            let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin> = match &out {
                Some(file) => Box::new(tokio::fs::File::create(file).await?),
                None => Box::new(tokio::io::stdout()),
            };
            while let Some(chunk) = stream.next().await {
                sink.write_all(&chunk?).await?;
            }
            sink.flush().await?;
            Ok(())
        }
        Commands::Rm { path, soft } => {
            let ctx = RequestContext::new(&cli.actor, &path);
            let report = ingestor
                .delete(&ctx, DeleteOptions { soft_delete: soft })
                .await
                .with_context(|| format!("Failed to delete {}", path))?;
            print_json(&report)
        }
        Commands::Stat { path } => {
            let ctx = RequestContext::new(&cli.actor, &path);
            let record = ingestor.stat(&ctx).await?;
            print_json(&record)
        }
        Commands::Sync { manifest, replace } => {
            let ctx = RequestContext::new(&cli.actor, "/");
            let manifest = SyncManifest::load(&manifest)
                .await
                .with_context(|| format!("Failed to read manifest {}", manifest.display()))?;
            let report = ingestor
                .sync(&ctx, &manifest.entries, SyncOptions { replace })
                .await?;
            print_json(&report)
        }
        Commands::Powerwash { yes } => {
            if !yes {
                bail!("powerwash deletes everything; pass --yes to confirm");
            }
            let ctx = RequestContext::new(&cli.actor, "/");
            ingestor.power_wash(&ctx).await?;
            tracing::info!("Store wiped");
            Ok(())
        }
    }
}
