//! Ridgeline administration tool
//!
//! Works on the database described by a config file: writes a starting
//! config, creates and deletes databases, and dumps their internal state.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ridgeline_core::memsize::parse_size;
use ridgeline_core::storage::{Database, DatabaseConfig};
use ridgeline_core::wal::WalConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ridgeline-cli", version, about = "Ridgeline administration tool")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "ridgeline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a default configuration file
    Init {
        /// Database directory
        #[arg(long, default_value = "data")]
        path: PathBuf,
        /// Add volumes when the store fills up instead of failing
        #[arg(long)]
        expandable: bool,
        /// Leave the write-ahead log out
        #[arg(long)]
        disable_wal: bool,
        /// Number of volumes
        #[arg(long)]
        volumes: Option<usize>,
        /// Volume size, e.g. `256MB` or `4GB`
        #[arg(long)]
        volume_size: Option<String>,
        /// Replace an existing file
        #[arg(long)]
        overwrite: bool,
    },
    /// Create the database described by the configuration
    Create {
        /// Write out volume files in full
        #[arg(long)]
        allocate: bool,
    },
    /// Delete the database and its WAL
    Delete {
        /// Delete even if it still holds series
        #[arg(long)]
        force: bool,
    },
    /// Print the state of the database as JSON
    DebugDump {
        /// Output file, stdout when absent
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print what a restart would recover, without changing any file
    DebugRecoveryDump {
        /// Output file, stdout when absent
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// The tables of the daemon config file this tool cares about
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    storage: DatabaseConfig,
    #[serde(default)]
    wal: Option<WalConfig>,
}

impl ConfigFile {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        toml::from_str(&text).with_context(|| format!("failed to parse config file {:?}", path))
    }

    fn database(self) -> DatabaseConfig {
        self.storage.with_wal(self.wal)
    }
}

fn init(
    config_path: &Path,
    path: PathBuf,
    expandable: bool,
    disable_wal: bool,
    volumes: Option<usize>,
    volume_size: Option<String>,
    overwrite: bool,
) -> anyhow::Result<()> {
    if config_path.exists() && !overwrite {
        bail!("{:?} already exists, pass --overwrite to replace it", config_path);
    }

    let mut storage = DatabaseConfig::new(&path);
    storage.expandable = expandable;
    if let Some(volumes) = volumes {
        storage.volumes = volumes;
    }
    if let Some(size) = volume_size {
        storage.volume_size = parse_size(&size)?;
    }
    let wal = (!disable_wal).then(|| WalConfig {
        dir: path.join("wal"),
        ..WalConfig::default()
    });

    let body = toml::to_string_pretty(&ConfigFile { storage, wal })?;
    let mut text = String::from("# Ridgeline configuration\n#\n");
    text.push_str("# Listeners go in a [server] table, e.g. http = \"0.0.0.0:8181\".\n");
    text.push_str("# Removing the [wal] table disables the write-ahead log.\n\n");
    text.push_str(&body);
    fs::write(config_path, text)?;

    println!("Wrote {}", config_path.display());
    Ok(())
}

fn dump<T: Serialize>(report: &T, output: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    match output {
        Some(path) => {
            fs::write(path, json + "\n")?;
            info!("Report written to {:?}", path);
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", json)?;
        }
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Init {
            path,
            expandable,
            disable_wal,
            volumes,
            volume_size,
            overwrite,
        } => init(
            &cli.config,
            path,
            expandable,
            disable_wal,
            volumes,
            volume_size,
            overwrite,
        ),
        Command::Create { allocate } => {
            let mut config = ConfigFile::load(&cli.config)?.database();
            config.allocate |= allocate;
            Database::create(&config)?;
            println!("Created database in {}", config.path.display());
            Ok(())
        }
        Command::Delete { force } => {
            let config = ConfigFile::load(&cli.config)?.database();
            Database::remove(&config, force)?;
            println!("Deleted database in {}", config.path.display());
            Ok(())
        }
        Command::DebugDump { output } => {
            let mut config = ConfigFile::load(&cli.config)?.database();
            config.checkpoint_interval = 0;
            let db = Database::open(config)?;
            dump(&db.debug_report(), output.as_deref())?;
            db.close()?;
            Ok(())
        }
        Command::DebugRecoveryDump { output } => {
            let config = ConfigFile::load(&cli.config)?.database();
            dump(&Database::recovery_report(&config)?, output.as_deref())
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so that dumps on stdout stay valid JSON
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    run(Cli::parse())
}
