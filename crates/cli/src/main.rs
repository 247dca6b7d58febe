// tenantctl
// Operator CLI for provisioning and tearing down tenant namespaces

mod config;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Config;
use dotenvy::dotenv;
use medrec_database::{
    Database, MigrationRegistry, OperationContext, SchemaProvisioner, TenantConnectionRouter,
};
use medrec_models::{CreateTenant, TenantId};
use medrec_tenant::TenantService;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tenantctl", version, about = "Manage per-tenant database namespaces")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "MEDREC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Migrations directory, overrides the configured one
    #[arg(short, long, global = true)]
    migrations: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the tenant namespace if needed and apply pending migrations
    Provision {
        tenant: String,
        /// Give up after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Onboard a new tenant under a generated id
    Onboard {
        prefix: String,
        #[arg(long)]
        name: String,
    },
    /// Drop the tenant namespace and everything in it
    Drop {
        tenant: String,
        /// Required; dropping a namespace destroys its data
        #[arg(long)]
        yes: bool,
    },
    /// Show applied and pending migrations for a tenant
    Status {
        tenant: String,
        #[arg(long)]
        json: bool,
    },
    /// List the migration scripts that would be applied
    Migrations,
    /// List tenant namespaces present in the database
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,medrec_database=debug".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(dir) = cli.migrations {
        config.migrations_dir = dir;
    }

    // Listing migrations never needs a database
    if let Command::Migrations = cli.command {
        return list_migrations(&config).await;
    }

    let database = Database::new(config.database.clone())
        .await
        .context("failed to connect to database")?;
    tracing::debug!("Connected to database");

    let provisioner = SchemaProvisioner::new(database.pool().clone(), config.provisioner.clone());
    let router = TenantConnectionRouter::new(database.pool().clone(), config.router.clone());
    let service = TenantService::new(provisioner.clone(), router, config.migrations_dir.clone());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            signal.cancel();
        }
    });

    let outcome = run(cli.command, &service, &provisioner, shutdown).await;
    database.close().await;
    outcome
}

async fn run(
    command: Command,
    service: &TenantService,
    provisioner: &SchemaProvisioner,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Command::Provision {
            tenant,
            timeout_secs,
        } => {
            let tenant_id = TenantId::new(&tenant)?;
            let mut ctx = OperationContext::new().with_cancellation(shutdown);
            if let Some(secs) = timeout_secs {
                ctx = ctx.with_timeout(Duration::from_secs(secs));
            }

            let report = service.upgrade(&ctx, &tenant_id).await?;
            println!(
                "{}: applied {:?}, skipped {}, now at {}",
                report.namespace,
                report.applied,
                report.skipped,
                format_version(report.current_version)
            );
        }
        Command::Onboard { prefix, name } => {
            let ctx = OperationContext::new().with_cancellation(shutdown);
            let tenant = service.onboard(&ctx, &CreateTenant { prefix, name }).await?;
            println!(
                "{} -> {} (version {})",
                tenant.tenant_id,
                tenant.namespace(),
                format_version(tenant.schema_version)
            );
        }
        Command::Drop { tenant, yes } => {
            let tenant_id = TenantId::new(&tenant)?;
            if !yes {
                bail!(
                    "refusing to drop {} without --yes",
                    tenant_id.namespace()
                );
            }
            let ctx = OperationContext::new().with_cancellation(shutdown);
            provisioner.try_drop_tenant_namespace(&ctx, &tenant_id).await?;
            println!("dropped {}", tenant_id.namespace());
        }
        Command::Status { tenant, json } => {
            let tenant_id = TenantId::new(&tenant)?;
            let status = service.status(&tenant_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("namespace:       {}", status.namespace);
                println!("exists:          {}", status.exists);
                println!("current version: {}", format_version(status.current_version));
                println!("pending:         {:?}", status.pending);
            }
        }
        Command::List => {
            for tenant_id in provisioner.list_tenant_namespaces().await? {
                println!("{}\t{}", tenant_id, tenant_id.namespace());
            }
        }
        Command::Migrations => unreachable!("handled before connecting"),
    }

    Ok(())
}

async fn list_migrations(config: &Config) -> anyhow::Result<()> {
    let registry = MigrationRegistry::scan(&config.migrations_dir).await?;
    if registry.is_empty() {
        println!("no migrations in {}", config.migrations_dir.display());
        return Ok(());
    }
    for migration in registry.migrations() {
        let script = migration.load().await?;
        println!(
            "{:>6}  {:<32}  {}",
            migration.version,
            migration.name,
            &script.checksum[..12]
        );
    }
    Ok(())
}

fn format_version(version: Option<i64>) -> String {
    version.map_or_else(|| "none".to_string(), |v| v.to_string())
}
