//! Migration CLI.
//!
//! Computes the additive DDL plan for a schema file against a live database
//! and applies it. The same planner runs inside the server at startup; this
//! tool exists for deployments that migrate ahead of rollout.
//!
//! Exit code 0 on success, 1 on any error.

use std::path::PathBuf;

use clap::{error::ErrorKind, Parser, Subcommand};
use lattice_engine::Schema;
use lattice_server::db;
use lattice_server::storage::ddl::{self, CollectionPlan};

#[derive(Parser)]
#[command(
    name = "lattice-migrate",
    version,
    about = "Project a Lattice schema into PostgreSQL"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Print the statements without executing them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Verbose output
    #[arg(long, global = true)]
    verbose: bool,

    /// Directory holding lattice.schema.json and .env
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// List pending statements for every collection
    List,
    /// Apply the plan for one collection
    Run { collection: String },
    /// Apply the plan for every collection
    RunAll,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) if matches!(error.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            // Help and version are not failures.
            print!("{error}");
            return;
        }
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(1);
        }
    };

    if let Err(error) = run(cli).await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("lattice_server=debug")
            .init();
    }

    let cwd = match &cli.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    dotenvy::from_path(cwd.join(".env")).ok();

    let schema_path = cwd.join("lattice.schema.json");
    let raw = std::fs::read_to_string(&schema_path)
        .map_err(|e| format!("cannot read {}: {e}", schema_path.display()))?;
    let schema = Schema::from_json(&raw)?;

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL is not set".to_string())?;
    let pool = db::create_pool(&database_url).await?;

    let plans = ddl::plan_schema(&pool, &schema).await?;

    match &cli.command {
        Command::List => {
            let mut pending = 0;
            for plan in &plans {
                print_plan(plan, cli.verbose);
                pending += plan.statements.len() + plan.index_statements.len();
            }
            if pending == 0 {
                println!("database is up to date");
            }
        }
        Command::Run { collection } => {
            let plan = plans
                .iter()
                .find(|plan| &plan.collection == collection)
                .ok_or_else(|| format!("unknown collection: {collection}"))?;
            apply(&pool, plan, cli.dry_run).await?;
        }
        Command::RunAll => {
            for plan in &plans {
                apply(&pool, plan, cli.dry_run).await?;
            }
        }
    }

    Ok(())
}

fn print_plan(plan: &CollectionPlan, verbose: bool) {
    if plan.is_empty() && plan.warnings.is_empty() {
        if verbose {
            println!("{}: up to date", plan.collection);
        }
        return;
    }
    println!("{}:", plan.collection);
    for statement in plan.statements.iter().chain(&plan.index_statements) {
        println!("  {statement};");
    }
    for warning in &plan.warnings {
        println!("  -- warning: {warning}");
    }
}

async fn apply(
    pool: &sqlx::PgPool,
    plan: &CollectionPlan,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if plan.is_empty() {
        println!("{}: up to date", plan.collection);
        return Ok(());
    }
    if dry_run {
        print_plan(plan, true);
        return Ok(());
    }
    ddl::apply_plan(pool, plan).await?;
    println!(
        "{}: applied {} statements, {} indexes",
        plan.collection,
        plan.statements.len(),
        plan.index_statements.len()
    );
    Ok(())
}
