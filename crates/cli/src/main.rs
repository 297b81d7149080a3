//! Command-line front end for coffer.
//!
//! Every command opens the configured stores, runs one engine operation and
//! prints its result as JSON on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use coffer_core::config::AppConfig;
use coffer_core::{FileId, FileRecord, RangeSpec};
use coffer_engine::{DownloadTarget, Engine, UploadRequest};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cofferctl")]
#[command(about = "Store and retrieve files in a coffer object store")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "COFFER_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Identifies one file, either by container and name or by id.
#[derive(Args, Clone)]
struct TargetArgs {
    /// Container holding the file
    #[arg(required_unless_present = "id")]
    container: Option<String>,

    /// File name (the most recently committed file with this name)
    #[arg(required_unless_present = "id")]
    name: Option<String>,

    /// File id, instead of container and name
    #[arg(long, conflicts_with_all = ["container", "name"])]
    id: Option<FileId>,
}

impl TargetArgs {
    fn into_target(self) -> Result<DownloadTarget> {
        match (self.id, self.container, self.name) {
            (Some(id), _, _) => Ok(DownloadTarget::Id(id)),
            (None, Some(container), Some(name)) => Ok(DownloadTarget::name(container, name)),
            _ => anyhow::bail!("either --id or a container and a file name are required"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file
    Put {
        /// Destination container
        container: String,
        /// File to upload, or `-` for stdin
        path: PathBuf,
        /// Stored file name (default: the file name of PATH)
        #[arg(long)]
        name: Option<String>,
        /// Media type recorded with the file
        #[arg(long)]
        mimetype: Option<String>,
        /// Extra metadata entries
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },
    /// Download a file, or a byte range of it
    Get {
        #[command(flatten)]
        target: TargetArgs,
        /// Byte range, e.g. bytes=0-1023, bytes=1024- or bytes=-512
        #[arg(long)]
        range: Option<RangeSpec>,
        /// Write to this path instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show a file's record
    Stat {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// List containers, or the files in one container
    Ls {
        container: Option<String>,
    },
    /// Delete a file
    Rm {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Delete a container and every file in it
    RmContainer {
        container: String,
        /// Skip the confirmation prompt
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Remove uploads left pending by a crashed process
    PurgeUploads {
        /// Only uploads started at least this many seconds ago
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },
    /// Check that both stores are reachable
    Health,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { config, command } = Cli::parse();

    let config = load_config(config.as_deref())?;
    let engine = Engine::open(&config)
        .await
        .context("failed to open storage")?;

    let result = run(&engine, command).await;
    engine.close().await;
    result
}

/// Optional TOML file overlaid with `COFFER_` environment variables
/// (`COFFER_STORAGE__PATH=/srv/chunks`).
fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if let Some(path) = path {
        anyhow::ensure!(path.exists(), "config file not found: {}", path.display());
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    }

    figment
        .merge(Env::prefixed("COFFER_").ignore(&["CONFIG"]).split("__"))
        .extract()
        .context("failed to load configuration")
}

async fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            container,
            path,
            name,
            mimetype,
            meta,
        } => handle_put(engine, container, &path, name, mimetype, meta).await,
        Commands::Get {
            target,
            range,
            output,
        } => handle_get(engine, target.into_target()?, range, output.as_deref()).await,
        Commands::Stat { target } => {
            let record = lookup(engine, target.into_target()?).await?;
            print_json(&record)
        }
        Commands::Ls { container: None } => {
            let containers = engine.list_containers().await?;
            print_json(&containers)
        }
        Commands::Ls {
            container: Some(container),
        } => {
            let container = engine.get_container(&container).await?;
            print_json(&container)
        }
        Commands::Rm { target } => {
            let removed = match target.into_target()? {
                DownloadTarget::Id(id) => engine.remove_file_by_id(id).await?,
                DownloadTarget::Name {
                    container,
                    filename,
                } => engine.remove_file(&container, &filename).await?,
            };
            print_json(&removed)
        }
        Commands::RmContainer { container, force } => {
            handle_rm_container(engine, &container, force).await
        }
        Commands::PurgeUploads { older_than_secs } => {
            let max_age = time::Duration::try_from(std::time::Duration::from_secs(older_than_secs))
                .context("--older-than-secs is out of range")?;
            let purged = engine.purge_stale_uploads(max_age).await?;
            print_json(&serde_json::json!({ "purged": purged }))
        }
        Commands::Health => {
            engine.health_check().await?;
            print_json(&serde_json::json!({ "status": "ok" }))
        }
    }
}

async fn handle_put(
    engine: &Engine,
    container: String,
    path: &Path,
    name: Option<String>,
    mimetype: Option<String>,
    meta: Vec<(String, String)>,
) -> Result<()> {
    let from_stdin = path == Path::new("-");
    let filename = match name {
        Some(name) => name,
        None if from_stdin => anyhow::bail!("--name is required when reading from stdin"),
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("cannot derive a file name from {}", path.display()))?,
    };

    let mut request = UploadRequest::new(container, filename);
    for (key, value) in meta {
        request = request.with_metadata(key, value);
    }
    if let Some(mimetype) = mimetype {
        request = request.with_mimetype(mimetype);
    }

    let record = if from_stdin {
        engine.upload_reader(request, tokio::io::stdin()).await?
    } else {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        engine.upload_reader(request, file).await?
    };

    if let Some(existing) = record.duplicate_of {
        tracing::info!(file_id = %existing, "Identical content already stored");
    }
    print_json(&record)
}

async fn handle_get(
    engine: &Engine,
    target: DownloadTarget,
    range: Option<RangeSpec>,
    output: Option<&Path>,
) -> Result<()> {
    let download = engine.download(target, range).await?;
    tracing::debug!(
        file_id = %download.record.id,
        content_length = download.content_length(),
        content_range = ?download.content_range(),
        "Downloading"
    );

    let Some(path) = output else {
        return copy_stream(download.into_stream(), tokio::io::stdout()).await;
    };

    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    if let Err(e) = copy_stream(download.into_stream(), file).await {
        // Leave no partial file behind.
        let _ = tokio::fs::remove_file(path).await;
        return Err(e);
    }
    Ok(())
}

async fn copy_stream<W>(mut stream: coffer_engine::ByteStream, mut out: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(piece) = stream.next().await {
        let piece = piece.context("download interrupted")?;
        out.write_all(&piece).await.context("failed to write output")?;
    }
    out.flush().await.context("failed to write output")?;
    Ok(())
}

async fn lookup(engine: &Engine, target: DownloadTarget) -> Result<FileRecord> {
    let record = match target {
        DownloadTarget::Id(id) => engine.get_file_by_id(id).await?,
        DownloadTarget::Name {
            container,
            filename,
        } => engine.get_file(&container, &filename).await?,
    };
    Ok(record)
}

async fn handle_rm_container(engine: &Engine, container: &str, force: bool) -> Result<()> {
    if !force {
        use std::io::Write;
        let files = engine.list_files(container).await?;
        eprint!(
            "This will delete container '{container}' and its {} file(s).\nAre you sure? [y/N]: ",
            files.len()
        );
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            eprintln!("Deletion cancelled.");
            return Ok(());
        }
    }

    let report = engine
        .destroy_container(container)
        .await
        .with_context(|| format!("failed to delete container {container}"))?;
    print_json(&report)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
