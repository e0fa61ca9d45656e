use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use data_vault::{
    entity_counts, load_csv, logging, resolve_workers, EntityRegistry, ProtectionContext,
    SourceBatches, VaultConfig, VaultPipeline, VaultStore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::warn;

#[derive(Parser)]
#[command(author, version, about = "Data Vault 2.0 ingestion engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = "VAULT_CONFIG", default_value = "vault.toml")]
    config: PathBuf,

    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the vault tables
    Init,

    /// Load customers, products and sales into the vault
    Import {
        #[arg(long)]
        customers: Option<PathBuf>,
        #[arg(long)]
        products: Option<PathBuf>,
        #[arg(long)]
        sales: Option<PathBuf>,
        /// Loader workers (default: configured value, else one per core)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decrypt a protected value with the configured key
    Reveal { value: String },

    /// Print a fresh base64 protection key for `protection_key`
    Keygen,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = VaultConfig::load(Some(&cli.config)).context("Failed to load configuration")?;
    logging::init_logging(config.log_format, cli.verbose)?;

    match cli.command {
        Command::Init => run_init(&config),
        Command::Import {
            customers,
            products,
            sales,
            workers,
            json,
        } => {
            let mut config = config;
            config.inputs.customers = customers.or(config.inputs.customers);
            config.inputs.products = products.or(config.inputs.products);
            config.inputs.sales = sales.or(config.inputs.sales);
            config.workers = workers.or(config.workers);
            run_import(&config, json)
        }
        Command::Reveal { value } => run_reveal(&config, &value),
        Command::Keygen => {
            let ctx = ProtectionContext::generate()?;
            println!("{}", ctx.export_key());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_init(config: &VaultConfig) -> Result<ExitCode> {
    let store = VaultStore::new(&config.database_path, config.busy_timeout());
    let registry = EntityRegistry::new();
    registry.validate()?;

    let conn = store
        .open()
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
    data_vault::setup_vault(&conn, &registry)?;

    println!("✓ Vault initialized at {}", config.database_path.display());
    Ok(ExitCode::SUCCESS)
}

fn run_import(config: &VaultConfig, json: bool) -> Result<ExitCode> {
    let entries = config.inputs.entries();
    if entries.is_empty() {
        bail!("no input files: pass --customers/--products/--sales or set [inputs]");
    }

    let mut batches = SourceBatches::new();
    for (kind, path) in entries {
        let rows = load_csv(path)
            .with_context(|| format!("Failed to read {} file {}", kind, path.display()))?;
        batches.insert(kind, rows);
    }

    if config.protection_key.is_none() {
        warn!("no protection_key configured: protected values from this run cannot be revealed later");
    }

    let workers = resolve_workers(config.workers);
    let store = VaultStore::new(&config.database_path, config.busy_timeout());
    let pipeline = VaultPipeline::new(store, EntityRegistry::new(), config.protection()?, workers)
        .with_default_source(config.source.clone());

    let report = pipeline.run(batches).context("Vault run aborted")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("🏛️  Data Vault import");
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        for gate in &report.gates {
            println!("✓ {}", gate.summary());
        }
        for column in &report.drift_columns {
            println!("➕ added column {}", column);
        }

        let conn = pipeline.store().open()?;
        for counts in entity_counts(&conn, pipeline.registry())? {
            println!(
                "📦 {}: {} anchor rows, {} satellite rows",
                counts.entity, counts.anchor_rows, counts.satellite_rows
            );
        }

        for issue in &report.issues.samples {
            println!(
                "⚠️  {} line {}: {}",
                issue.entity, issue.line_number, issue.message
            );
        }
        if report.issues.count > report.issues.samples.len() {
            println!(
                "   ... {} more issues",
                report.issues.count - report.issues.samples.len()
            );
        }

        for failure in &report.chunk_failures {
            let lines: Vec<String> = failure
                .line_numbers
                .iter()
                .map(|(entity, line)| format!("{}:{}", entity, line))
                .collect();
            println!(
                "❌ stage {} chunk {} failed: {}\n   re-run lines: {}",
                failure.stage,
                failure.chunk,
                failure.error,
                lines.join(", ")
            );
        }

        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("{}", report.summary());
    }

    if report.has_failures() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn run_reveal(config: &VaultConfig, value: &str) -> Result<ExitCode> {
    let Some(key) = &config.protection_key else {
        bail!("reveal needs protection_key in the configuration (or VAULT_PROTECTION_KEY)");
    };

    let ctx = ProtectionContext::from_base64(key)?;
    println!("{}", ctx.reveal(value)?);
    Ok(ExitCode::SUCCESS)
}
