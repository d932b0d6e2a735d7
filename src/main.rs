//! # commcare-sync CLI (`ccsync`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ccsync init` | Create the SQLite database and checkpoint table |
//! | `ccsync export --query <file>` | Run an incremental export |
//! | `ccsync dump-query --query <file>` | Print the parsed query |
//! | `ccsync fingerprint <file>` | Print a file's content fingerprint |
//! | `ccsync checkpoints` | List stored checkpoints |
//!
//! ## Examples
//!
//! ```bash
//! # Export forms into SQLite, resuming from the last checkpoint
//! ccsync export --query forms.json --output-format sql --project demo \
//!     --username me@example.org --password "$KEY"
//!
//! # Re-export a fixed window to a zip of CSV files
//! ccsync export --query forms.json --output-format csv --output forms.zip \
//!     --since 2012-01-01 --until 2012-08-01 --start-over
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use commcare_sync::config::{self, Config};
use commcare_sync::connector_hq::{AuthMode, Credentials};
use commcare_sync::export::{self, ExportRequest, OutputFormat};
use commcare_sync::progress::{self, LogFormat};
use commcare_sync::{checkpoint, db};
use commcare_sync_core::fingerprint::fingerprint_file;
use commcare_sync_core::log::LogLevel;

/// Incremental CommCare HQ exports.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. The file is optional; flags override its values.
#[derive(Parser)]
#[command(
    name = "ccsync",
    about = "Incremental, resumable exports of CommCare HQ data into tables",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ccsync.toml")]
    config: PathBuf,

    /// Log debug messages.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Log output format on stderr.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the checkpoint table. Safe to
    /// run more than once.
    Init,

    /// Export the tables of a query.
    ///
    /// Pages through every resource the query reads and writes the rows
    /// to the chosen output. With `sql` output (or `--checkpoint-db`) the
    /// export resumes from the last committed page.
    Export(ExportArgs),

    /// Print the parsed query definition as JSON.
    DumpQuery {
        /// Query definition file (JSON).
        #[arg(long)]
        query: PathBuf,
    },

    /// Print the content fingerprint (SHA-256) of a file.
    Fingerprint {
        file: PathBuf,
    },

    /// List stored checkpoints.
    Checkpoints {
        /// Checkpoint database; defaults to `[db].path`.
        #[arg(long)]
        checkpoint_db: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct ExportArgs {
    /// Query definition file (JSON).
    #[arg(long)]
    query: PathBuf,

    #[arg(long, value_enum, default_value = "json")]
    output_format: OutputFormat,

    /// Output file (zip for csv, workbook for xlsx, database for sql).
    /// Defaults to stdout, or `[db].path` for sql.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Only export records modified at or after this time
    /// (YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS).
    #[arg(long)]
    since: Option<String>,

    /// Only export records modified before this time.
    #[arg(long)]
    until: Option<String>,

    /// Ignore stored checkpoints.
    #[arg(long)]
    start_over: bool,

    #[arg(long)]
    run_id: Option<String>,

    #[arg(long)]
    page_size: Option<usize>,

    #[arg(long)]
    project: Option<String>,

    /// Base URL or alias (`prod`, `local`).
    #[arg(long)]
    base_url: Option<String>,

    #[arg(long)]
    username: Option<String>,

    /// API key or password. Falls back to `COMMCARE_API_KEY`.
    #[arg(long)]
    password: Option<String>,

    /// `apikey` or `basic`.
    #[arg(long)]
    auth_mode: Option<String>,

    /// Value written for empty cells.
    #[arg(long)]
    missing_value: Option<String>,

    /// Persist checkpoints here for non-sql output formats.
    #[arg(long)]
    checkpoint_db: Option<PathBuf>,
}

impl ExportArgs {
    /// Apply flag overrides on top of the file config.
    fn apply(&self, mut cfg: Config) -> Result<Config> {
        if let Some(v) = &self.run_id {
            cfg.export.run_id = v.clone();
        }
        if let Some(v) = self.page_size {
            cfg.export.page_size = v;
        }
        if let Some(v) = &self.missing_value {
            cfg.export.missing_value = Some(v.clone());
        }
        if let Some(v) = &self.project {
            cfg.hq.project = Some(v.clone());
        }
        if let Some(v) = &self.base_url {
            cfg.hq.base_url = v.clone();
        }
        if let Some(v) = &self.username {
            cfg.hq.username = Some(v.clone());
        }
        if let Some(v) = &self.auth_mode {
            cfg.hq.auth_mode = v.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn credentials(&self, cfg: &Config) -> Result<Option<Credentials>> {
        let secret = self
            .password
            .clone()
            .or_else(|| std::env::var("COMMCARE_API_KEY").ok());
        match (&cfg.hq.username, secret) {
            (Some(username), Some(secret)) => Ok(Some(Credentials {
                mode: AuthMode::parse(&cfg.hq.auth_mode)?,
                username: username.clone(),
                secret,
            })),
            _ => Ok(None),
        }
    }

    fn request(&self) -> ExportRequest {
        ExportRequest {
            query_path: self.query.clone(),
            format: self.output_format,
            output: self.output.clone(),
            since: self.since.clone(),
            until: self.until.clone(),
            start_over: self.start_over,
            checkpoint_db: self.checkpoint_db.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    progress::init_tracing(cli.verbose, cli.log_format)?;
    let log = cli.log_format.run_log();

    match cli.command {
        Commands::Init => {
            let cfg = config::load_or_default(&cli.config)?;
            let pool = db::open(&cfg.db.path).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Export(args) => {
            let cfg = args.apply(config::load_or_default(&cli.config)?)?;
            let credentials = args.credentials(&cfg)?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            let signal_log = Arc::clone(&log);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal_log.log(
                        LogLevel::Warn,
                        "interrupt received, stopping after the current page",
                    );
                    on_signal.cancel();
                }
            });

            let summary =
                export::run_export(&cfg, &args.request(), credentials, log, cancel).await?;
            if summary.cancelled {
                std::process::exit(130);
            }
        }
        Commands::DumpQuery { query } => {
            println!("{}", export::dump_query(&query)?);
        }
        Commands::Fingerprint { file } => {
            let fingerprint = fingerprint_file(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            println!("{}", fingerprint);
        }
        Commands::Checkpoints { checkpoint_db } => {
            let path = match checkpoint_db {
                Some(path) => path,
                None => config::load_or_default(&cli.config)?.db.path,
            };
            checkpoint::run_list(&path).await?;
        }
    }

    Ok(())
}
