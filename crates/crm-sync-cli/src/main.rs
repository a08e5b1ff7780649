//! crm-sync CLI - paginated record synchronization into a CRM.

use clap::{Parser, Subcommand};
use crm_sync::config::PaginationMode;
use crm_sync::{AssociationRegistry, Config, MappingTable, MigrationReport, MigrationRunner, SyncError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "crm-sync")]
#[command(about = "Paginated record synchronization into a CRM")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "sync.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured sync job
    Run {
        /// Read the source but write to an in-memory target
        #[arg(long)]
        dry_run: bool,

        /// Stop after the first page
        #[arg(long)]
        single_page: bool,

        /// Stop after this many pages
        #[arg(long)]
        max_pages: Option<u32>,
    },

    /// Check the configuration and mapping table without network calls
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, SyncError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            dry_run,
            single_page,
            max_pages,
        } => {
            let mut runner = MigrationRunner::from_config(&config, dry_run)?.with_max_pages(max_pages);
            if single_page {
                runner = runner.with_pagination_mode(PaginationMode::SinglePage);
            }

            let report = tokio::select! {
                report = runner.run() => report?,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("\nReceived Ctrl-C, abandoning run");
                    return Ok(ExitCode::FAILURE);
                }
            };

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                print_summary(&report);
            }

            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Validate => {
            let mapping = MappingTable::load(&config.job.mapping)?;
            if let Some(rule) = &config.job.association {
                AssociationRegistry::from_codes(&config.associations)
                    .require(&mapping.object_type, &rule.to_type)?;
            }
            println!("Configuration is valid");
            println!("  Job: {}", config.job.name);
            println!("  Source: {}", config.source.base_url);
            println!(
                "  Mapping: {} ({} fields, natural key '{}')",
                mapping.object_type,
                mapping.fields.len(),
                mapping.natural_key
            );
            println!("  Association codes: {}", config.associations.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_summary(report: &MigrationReport) {
    let status_msg = match (report.is_success(), report.dry_run) {
        (true, true) => "Dry run completed!",
        (true, false) => "Sync completed!",
        (false, _) => "Sync failed!",
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", report.run_id);
    println!("  Job: {}", report.job);
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!("  Pages: {}", report.pages);
    println!("  Migrated: {}", report.stats.migrated);
    println!("  Failed: {}", report.stats.failed);
    println!("  Not found: {}", report.stats.not_found);
    if let Some(ref err) = report.error {
        println!("  Error: {}", err);
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
