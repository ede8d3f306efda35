//! EO custody CLI
//!
//! Entry point for the `eo-custody` command-line tool.

use clap::{Parser, Subcommand, ValueEnum};
use eo_custody::audit::ids;
use eo_custody::stages::archive::CatalogFilter;
use eo_custody::{
    AuditOutcome, Credentials, EffectiveConfig, Orchestrator, PipelineError, ProductStatus,
    ReferenceKind,
};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

/// Bytes written over a vault artifact by the corruption drill
const DRILL_GARBAGE: &[u8] = b"CORRUPTED_DATA_BY_DRILL";

#[derive(Parser)]
#[command(name = "eo-custody")]
#[command(about = "Chain-of-custody integrity engine for EO data products", version)]
struct Cli {
    /// Identity the command runs as
    #[arg(long, short = 'u', global = true, env = "EO_CUSTODY_USER")]
    user: Option<String>,

    /// Password for identities with a password hash on file
    #[arg(long, global = true, env = "EO_CUSTODY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Path to project config file (default: ./eo-custody.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Override the zone tree root
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the zone tree and the active key
    Init,

    /// Land a synthetic product
    Generate {
        product_id: String,

        /// Inject a dead pixel the QC step must reject
        #[arg(long)]
        corrupted: bool,
    },

    /// Validate and fingerprint a landed product
    Ingest { product_id: String },

    /// Apply the radiometric transform
    Process { product_id: String },

    /// Seal a processed product into the vault
    Archive { product_id: String },

    /// Copy a vault artifact to backup storage
    Replicate { product_id: String },

    /// Audit a vault artifact and heal it from the replica
    Audit {
        product_id: String,

        /// Source of the trusted fingerprint
        #[arg(long, value_enum, default_value_t = ReferenceArg::Catalog)]
        reference: ReferenceArg,
    },

    /// Decrypt a copy of a vault artifact
    Retrieve { product_id: String, output: PathBuf },

    /// Overwrite a vault artifact with garbage (drill)
    Corrupt { product_id: String },

    /// Re-seal all artifacts under a new key
    RotateKeys,

    /// Show where a product stands
    Status { product_id: String },

    /// List vault catalog entries
    Catalog {
        /// Only entries with this status
        #[arg(long)]
        status: Option<ProductStatus>,
    },

    /// Scan the audit log for incidents
    Ids,

    /// Run the full pipeline for one product
    Run {
        product_id: String,

        #[arg(long)]
        corrupted: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReferenceArg {
    Replica,
    Catalog,
}

impl From<ReferenceArg> for ReferenceKind {
    fn from(arg: ReferenceArg) -> Self {
        match arg {
            ReferenceArg::Replica => ReferenceKind::Replica,
            ReferenceArg::Catalog => ReferenceKind::Catalog,
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let orch = match open(&cli) {
        Ok(o) => o,
        Err(e) => fail(&e, cli.json),
    };
    let json = cli.json;
    if let Commands::Init = cli.command {
        return run_init(&orch, json);
    }
    if let Commands::Ids = cli.command {
        return run_ids(&orch, json);
    }

    let Some(user) = cli.user.as_deref() else {
        eprintln!("Error: --user (or EO_CUSTODY_USER) is required for this command");
        process::exit(2);
    };
    let creds = match &cli.password {
        Some(secret) => Credentials::with_secret(user, secret),
        None => Credentials::identity(user),
    };

    match cli.command {
        Commands::Init | Commands::Ids => {}
        Commands::Generate {
            product_id,
            corrupted,
        } => report(orch.generate(&creds, &product_id, corrupted), json),
        Commands::Ingest { product_id } => report(orch.ingest(&creds, &product_id), json),
        Commands::Process { product_id } => report(orch.process(&creds, &product_id), json),
        Commands::Archive { product_id } => report(orch.archive(&creds, &product_id), json),
        Commands::Replicate { product_id } => report(orch.replicate(&creds, &product_id), json),
        Commands::Audit {
            product_id,
            reference,
        } => run_audit(&orch, &creds, &product_id, reference.into(), json),
        Commands::Retrieve { product_id, output } => {
            report(orch.retrieve(&creds, &product_id, &output), json)
        }
        Commands::Corrupt { product_id } => {
            let result = orch.simulate_corruption(&creds, &product_id, DRILL_GARBAGE);
            report(result.map(|()| json!({ "product_id": product_id, "corrupted": true })), json)
        }
        Commands::RotateKeys => report(orch.rotate_keys(&creds), json),
        Commands::Status { product_id } => report(orch.status(&creds, &product_id), json),
        Commands::Catalog { status } => {
            let filter = CatalogFilter {
                status,
                ..CatalogFilter::default()
            };
            report(orch.catalog_snapshot(&creds, &filter), json)
        }
        Commands::Run {
            product_id,
            corrupted,
        } => report(orch.run_pipeline(&creds, &product_id, corrupted), json),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("EO_CUSTODY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open(cli: &Cli) -> Result<Orchestrator, PipelineError> {
    let cwd = std::env::current_dir()?;
    let overrides = cli
        .base_dir
        .as_ref()
        .map(|dir| json!({ "base_dir": dir }));
    let effective = EffectiveConfig::discover(cli.config.as_deref(), &cwd, overrides)?;
    tracing::debug!(sources = effective.sources.len(), "configuration loaded");
    Orchestrator::open_with_audit_log(effective.settings)
}

fn run_init(orch: &Orchestrator, json: bool) {
    let summary = json!({
        "base_dir": orch.store().base_dir(),
        "key_path": orch.key_store().path(),
        "key_id": orch.active_key_id(),
        "audit_log": orch.settings().resolved_audit_log(),
    });
    if json {
        print_json(&summary);
    } else {
        println!("Initialized {}", orch.store().base_dir().display());
        println!("  Active key: {}", orch.active_key_id());
        println!("  Audit log: {}", orch.settings().resolved_audit_log().display());
    }
}

fn run_audit(
    orch: &Orchestrator,
    creds: &Credentials,
    product_id: &str,
    kind: ReferenceKind,
    json: bool,
) {
    match orch.audit(creds, product_id, kind) {
        Ok(AuditOutcome::Unrecoverable) => {
            fail(&PipelineError::Unrecoverable(product_id.to_string()), json)
        }
        result => report(result, json),
    }
}

fn run_ids(orch: &Orchestrator, json: bool) {
    let incidents = orch.scan_audit_log();
    if json {
        print_json(&incidents);
    } else if incidents.is_empty() {
        println!("No incidents detected");
    } else {
        for incident in &incidents {
            println!(
                "[{:?}] {}: {}",
                incident.severity, incident.incident_type, incident.details
            );
        }
    }
    let critical = incidents
        .iter()
        .any(|i| i.severity == ids::IncidentSeverity::Critical);
    if critical {
        process::exit(1);
    }
}

/// Print a successful result or exit with the error's code
fn report<T: Serialize>(result: Result<T, PipelineError>, json: bool) {
    match result {
        Ok(value) if json => print_json(&value),
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(1);
            }
        },
        Err(e) => fail(&e, json),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string(value) {
        Ok(text) => println!("{}", text),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            process::exit(1);
        }
    }
}

fn fail(err: &PipelineError, json: bool) -> ! {
    if json {
        let body = json!({
            "error": err.to_string(),
            "category": err.category(),
            "exit_code": err.exit_code(),
        });
        eprintln!("{}", body);
    } else {
        eprintln!("Error: {}", err);
    }
    process::exit(err.exit_code());
}
