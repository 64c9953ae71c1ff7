//! cachefs command line.
//!
//! Usage:
//!   # Fetch through a mirror into the default cache root
//!   cachefs -o fileSystemWrapper=mirror -o remoteDirectory=/srv/origin \
//!       get cache://example.org/img/a.png > a.png
//!
//!   # Store a file, then inspect it
//!   cachefs put cache://example.org/notes.txt notes.txt
//!   cachefs stat cache://example.org/notes.txt
//!
//!   # Sweep entries older than an hour
//!   cachefs expire cache://example.org/ --max-age 3600000

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::{EnvFilter, fmt};

use cachefs_core::{Config, FileAttr, FileSystemProvider, WriteMode};

/// Access a caching virtual filesystem.
#[derive(Parser, Debug)]
#[command(name = "cachefs")]
#[command(about = "Read, write and expire entries of a cachefs filesystem")]
struct Args {
    /// Cache root (default: $CACHEFS_BASE or the platform cache directory)
    #[arg(long, global = true)]
    cache_root: Option<PathBuf>,

    /// Configuration override, repeatable (e.g. -o maxAge=60000)
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE", global = true)]
    options: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy an entry to stdout or a file
    Get {
        uri: String,
        /// Write here instead of stdout
        #[arg(short = 'O', long)]
        output: Option<PathBuf>,
    },
    /// Store a file (or stdin) at an entry
    Put {
        uri: String,
        /// Read from here instead of stdin
        input: Option<PathBuf>,
        /// Append instead of replacing
        #[arg(long)]
        append: bool,
    },
    /// Print entry attributes as JSON
    Stat { uri: String },
    /// List a directory
    Ls {
        uri: String,
        /// Print JSON instead of one name per line
        #[arg(long)]
        json: bool,
    },
    /// Delete an entry
    Rm {
        uri: String,
        /// Fail if the entry does not exist
        #[arg(long)]
        must_exist: bool,
    },
    /// Sweep entries older than the given age
    Expire {
        uri: String,
        /// Age limit in milliseconds
        #[arg(long)]
        max_age: u64,
    },
}

#[derive(Serialize)]
struct StatOutput<'a> {
    path: &'a str,
    #[serde(flatten)]
    attr: FileAttr,
}

fn parse_options(options: &[String]) -> Result<Config> {
    let mut config = Config::new();
    for option in options {
        let Some((key, value)) = option.split_once('=') else {
            bail!("option {option:?} is not KEY=VALUE");
        };
        config.insert(key.trim(), value.trim());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries file contents.
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let defaults = parse_options(&args.options)?;
    let provider = match args.cache_root {
        Some(root) => FileSystemProvider::new(root),
        None => FileSystemProvider::from_env().context("locating cache root")?,
    }
    .with_defaults(defaults);

    let result = run(&provider, args.command).await;
    provider.close_all().await.context("closing filesystems")?;
    result
}

async fn run(provider: &FileSystemProvider, command: Command) -> Result<()> {
    match command {
        Command::Get { uri, output } => {
            let (fs, path) = provider.open(&uri).await?;
            let mut reader = fs.open_read(&path).await.with_context(|| format!("reading {uri}"))?;
            let copied = match output {
                Some(file) => {
                    let mut out = tokio::fs::File::create(&file)
                        .await
                        .with_context(|| format!("creating {}", file.display()))?;
                    let n = tokio::io::copy(&mut reader, &mut out).await?;
                    out.flush().await?;
                    n
                }
                None => {
                    let mut out = tokio::io::stdout();
                    let n = tokio::io::copy(&mut reader, &mut out).await?;
                    out.flush().await?;
                    n
                }
            };
            tracing::debug!(uri = %uri, bytes = copied, "get complete");
        }
        Command::Put { uri, input, append } => {
            let (fs, path) = provider.open(&uri).await?;
            let mut data = Vec::new();
            match input {
                Some(file) => {
                    data = tokio::fs::read(&file)
                        .await
                        .with_context(|| format!("reading {}", file.display()))?;
                }
                None => {
                    tokio::io::stdin().read_to_end(&mut data).await?;
                }
            }
            let mode = if append {
                WriteMode::Append
            } else {
                WriteMode::Truncate
            };
            let mut writer = fs.open_write(&path, mode).await?;
            writer.write(&data).await?;
            writer.close().await.with_context(|| format!("writing {uri}"))?;
            tracing::info!(uri = %uri, bytes = data.len(), "stored");
        }
        Command::Stat { uri } => {
            let (fs, path) = provider.open(&uri).await?;
            let attr = fs.stat(&path).await?;
            let output = StatOutput {
                path: path.as_str(),
                attr,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Ls { uri, json } => {
            let (fs, path) = provider.open(&uri).await?;
            let entries = fs.list(&path).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    let suffix = if entry.kind.is_dir() { "/" } else { "" };
                    println!("{}{suffix}", entry.name);
                }
            }
        }
        Command::Rm { uri, must_exist } => {
            let (fs, path) = provider.open(&uri).await?;
            if !fs.delete(&path, must_exist).await? {
                tracing::info!(uri = %uri, "nothing to delete");
            }
        }
        Command::Expire { uri, max_age } => {
            let (fs, _) = provider.open(&uri).await?;
            let report = fs.expire(Duration::from_millis(max_age)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
