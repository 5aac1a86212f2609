//! The `sonia` command.

#![deny(unsafe_code)]
#![deny(clippy::all)]

mod ingest;
mod serve;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "sonia", about = "Sonia core runtime", version)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the gateway (turn pipeline, memory façade, tool executor).
    Gateway,
    /// Serve the service supervisor.
    Supervisor,
    /// Manage ledger backups.
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    /// Ledger maintenance: decay sweeps and event compaction.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    /// Run the promotion gate matrix.
    Gates {
        /// Directory containing gate scripts.
        #[arg(long, default_value = "scripts/gates")]
        dir: PathBuf,
        /// Where to write the matrix JSON.
        #[arg(long, default_value = "reports/gate-matrix.json")]
        output: PathBuf,
    },
    /// Ingest knowledge files into the memory ledger.
    Ingest(ingest::IngestArgs),
}

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    /// Archive memories whose decay score fell below the forget
    /// threshold.
    Forget,
    /// Consolidate old event rows into summaries and archive the
    /// originals.
    Compact {
        /// Event row type to compact.
        #[arg(long = "type", default_value = "tool_result")]
        memory_type: String,
        /// Events older than this many days are consolidated.
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    /// Create a hot backup.
    Create {
        /// Optional label appended to the backup id.
        #[arg(long)]
        label: Option<String>,
    },
    /// Verify a backup's integrity.
    Verify {
        /// The backup id.
        backup_id: String,
    },
    /// Restore a backup (dry-run unless --live).
    Restore {
        /// The backup id.
        backup_id: String,
        /// Restore target (defaults to the live database).
        #[arg(long)]
        target: Option<PathBuf>,
        /// Perform the restore instead of a dry run.
        #[arg(long)]
        live: bool,
    },
    /// List backups, newest first.
    List,
    /// Prune backups beyond the retention cap.
    Prune,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = sonia_config::load(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Command::Gateway => runtime.block_on(serve::gateway(config)),
        Command::Supervisor => runtime.block_on(serve::supervisor(config)),
        Command::Backup { command } => run_backup(&config, command),
        Command::Memory { command } => run_memory(&config, command),
        Command::Gates { dir, output } => runtime.block_on(run_gates(dir, output)),
        Command::Ingest(args) => ingest::run(&config, &args),
    }
}

fn run_memory(config: &sonia_config::SoniaConfig, command: MemoryCommand) -> Result<()> {
    let ledger = sonia_ledger::MemoryDatabase::open(config.storage.memory_db_path())?;
    match command {
        MemoryCommand::Forget => {
            let archived = ledger.archive_forgotten()?;
            println!("archived {} forgotten memories", archived.len());
        }
        MemoryCommand::Compact { memory_type, days } => {
            let report = ledger.compact_events(&memory_type, days)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn run_backup(config: &sonia_config::SoniaConfig, command: BackupCommand) -> Result<()> {
    let db_path = config.storage.memory_db_path();
    let backup_dir = if config.backup.backup_dir.is_absolute() {
        config.backup.backup_dir.clone()
    } else {
        config.storage.data_dir.join(&config.backup.backup_dir)
    };
    let manager = sonia_ledger::BackupManager::new(
        db_path,
        backup_dir,
        config.backup.encrypt,
        config.backup.max_backups,
    )?;

    match command {
        BackupCommand::Create { label } => {
            let manifest = manager.create_backup(label.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        BackupCommand::Verify { backup_id } => {
            let report = manager.verify_backup(&backup_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.verified {
                anyhow::bail!("backup verification failed");
            }
        }
        BackupCommand::Restore {
            backup_id,
            target,
            live,
        } => {
            let report = manager.restore(&backup_id, target.as_deref(), !live)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        BackupCommand::List => {
            let manifests = manager.list_backups()?;
            println!("{}", serde_json::to_string_pretty(&manifests)?);
        }
        BackupCommand::Prune => {
            let pruned = manager.enforce_retention()?;
            println!("pruned {} backup(s)", pruned.len());
        }
    }
    Ok(())
}

async fn run_gates(dir: PathBuf, output: PathBuf) -> Result<()> {
    let mut gates = Vec::new();
    if dir.exists() {
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "sh" || e == "py"))
            .collect();
        entries.sort();
        for path in entries {
            // Scripts prefixed inherited- form the class-A floor;
            // evidence- scripts are class C; the rest are delta gates
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let class = if name.starts_with("inherited-") {
                sonia_gate::GateClass::A
            } else if name.starts_with("evidence-") {
                sonia_gate::GateClass::C
            } else {
                sonia_gate::GateClass::B
            };
            gates.push(sonia_gate::GateSpec::new(path, class));
        }
    }
    if gates.is_empty() {
        anyhow::bail!("no gate scripts found under {}", dir.display());
    }

    let runner = sonia_gate::GateRunner::new(sonia_gate::GateRunnerConfig::default());
    let matrix = runner.run_all(&gates).await;
    matrix.write(&output)?;
    println!(
        "verdict: {} ({} gates, matrix at {})",
        matrix.verdict,
        matrix.gates.len(),
        output.display()
    );
    if matrix.verdict != "PROMOTE" {
        std::process::exit(1);
    }
    Ok(())
}
