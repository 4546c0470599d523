//! CLI binary entry point for crm-elt

use clap::{Parser, Subcommand};
use crm_elt::cli::commands::CommonArgs;
use crm_elt::cli::commands::classify::{ClassifyArgs, handle_classify};
use crm_elt::cli::commands::init::{InitArgs, handle_init};
use crm_elt::cli::commands::query::{QueryArgs, handle_query};
use crm_elt::cli::commands::run::{RunArgs, Stage, handle_run};
use crm_elt::cli::commands::status::{StatusArgs, handle_status};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crm-elt")]
#[command(about = "Incremental ELT for CRM spreadsheet exports")]
#[command(version)]
struct Cli {
    /// Directory containing crm-elt.toml
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    /// Log generated SQL and per-row decisions
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the raw/bronze/gold/metadata schemas and the run log
    Init {
        /// Write a sample crm-elt.toml if none exists
        #[arg(long)]
        write_config: bool,
    },
    /// Extract, load, reconcile and refresh gold views
    Run {
        /// Only these tables (comma separated or repeated)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        /// Stage and extract only; write nothing
        #[arg(long)]
        dry_run: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stage source files and load them into raw
    Extract {
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Reconcile raw into bronze and refresh gold views
    Transform {
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show the watermark and latest run of every table
    Status,
    /// Show how filenames would be classified
    Classify {
        /// Filenames to classify
        filenames: Vec<String>,
        /// Treat this as the current year
        #[arg(long)]
        year: Option<i32>,
    },
    /// Execute SQL against the warehouse (`:runs`, `:watermarks`, `:tables` shortcuts)
    Query {
        /// SQL query to execute
        sql: String,
        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let common = CommonArgs {
        config_dir: cli.config_dir,
    };

    let run_args = |stage, tables, dry_run, json| RunArgs {
        common: common.clone(),
        stage,
        tables,
        dry_run,
        json,
    };

    let result = match cli.command {
        Commands::Init { write_config } => handle_init(&InitArgs {
            common: common.clone(),
            write_config,
        }),
        Commands::Run {
            tables,
            dry_run,
            json,
        } => handle_run(&run_args(Stage::All, tables, dry_run, json)),
        Commands::Extract {
            tables,
            dry_run,
            json,
        } => handle_run(&run_args(Stage::Extract, tables, dry_run, json)),
        Commands::Transform { tables, json } => {
            handle_run(&run_args(Stage::Transform, tables, false, json))
        }
        Commands::Status => handle_status(&StatusArgs {
            common: common.clone(),
        }),
        Commands::Classify { filenames, year } => handle_classify(&ClassifyArgs {
            common: common.clone(),
            filenames,
            year,
        }),
        Commands::Query { sql, format } => handle_query(&QueryArgs {
            common: common.clone(),
            sql,
            format,
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
