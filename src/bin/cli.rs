use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use org_scope::authz::{
    sync_grant_tables, Access, DataStoreEvaluator, MirrorEvaluator, PolicyEvaluator, Principal, ResourceContext,
    SystemRole,
};
use org_scope::cache::{CacheConfig, TenantCache};
use org_scope::store;

#[derive(Parser, Debug)]
#[command(author, version, about = "org-scope operator tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new empty migration with the provided name
    MakeMigration { name: String },
    /// Apply pending migrations
    MigrateRun,
    /// Show migration status against the current database
    MigrateStatus,
    /// Roll back the last applied migration
    MigrateRollback,
    /// Make an existing user a system administrator
    GrantAdmin {
        #[arg(long)]
        email: String,
    },
    /// Evaluate one decision with both evaluators, e.g. `--access project:milestones.edit`
    Check {
        #[arg(long)]
        email: String,
        #[arg(long)]
        org: Uuid,
        #[arg(long)]
        project: Option<Uuid>,
        #[arg(long)]
        access: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenvy::dotenv().is_err() {
        let crate_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(crate_env);
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::MakeMigration { name } => {
            let path = make_migration_file(&name)?;
            println!("Created migration: {}", path.display());
        }
        Commands::MigrateRun => {
            let pool = get_pool().await?;
            get_migrator().await?.run(&pool).await?;
            println!("Migrations applied");
        }
        Commands::MigrateStatus => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            print_status(&pool, &migrator).await?;
        }
        Commands::MigrateRollback => {
            let pool = get_pool().await?;
            get_migrator()
                .await?
                .undo(&pool, 1)
                .await
                .context("no migrations were rolled back")?;
            println!("Rolled back last migration");
        }
        Commands::GrantAdmin { email } => {
            let pool = get_pool().await?;
            let user = store::users::find_by_email(&pool, &email)
                .await?
                .with_context(|| format!("no user with email {email}"))?;
            let (_, after) = store::users::set_system_role(&pool, user.id, SystemRole::SystemAdmin).await?;
            println!("{} is now {}", after.email, after.system_role.as_str());
        }
        Commands::Check { email, org, project, access } => {
            let access = Access::from_str(&access)?;
            let pool = get_pool().await?;
            sync_grant_tables(&pool).await?;

            let user = store::users::find_by_email(&pool, &email)
                .await?
                .with_context(|| format!("no user with email {email}"))?;
            let principal = Principal::new(user.id).with_system_role(user.system_role);
            let mut ctx = ResourceContext::organisation(org);
            if let Some(project_id) = project {
                ctx = ctx.with_project(project_id);
            }

            let authoritative = DataStoreEvaluator::new(pool.clone()).decide(&principal, &ctx, access).await?;
            let mirror = MirrorEvaluator::new(pool.clone(), TenantCache::new(&CacheConfig::from_env()))
                .decide(&principal, &ctx, access)
                .await?;

            println!("{:<10} {:?}", "database", authoritative);
            println!("{:<10} {:?}", "mirror", mirror);
            if authoritative != mirror {
                anyhow::bail!("evaluators disagree on {}", access.label());
            }
        }
    }

    Ok(())
}

fn make_migration_file(name: &str) -> anyhow::Result<PathBuf> {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let filename = format!("{}_{}.sql", timestamp, sanitize_name(name));
    let path = Path::new("migrations").join(filename);

    if path.exists() {
        anyhow::bail!("migration already exists: {}", path.display());
    }

    fs::write(&path, "-- Write your migration SQL here\n")
        .with_context(|| format!("failed to create migration at {}", path.display()))?;

    Ok(path)
}

async fn get_pool() -> anyhow::Result<SqlitePool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let options = SqliteConnectOptions::from_str(&database_url)
        .context("invalid DATABASE_URL")?
        .create_if_missing(true)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to connect to database")
}

async fn print_status(pool: &SqlitePool, migrator: &sqlx::migrate::Migrator) -> anyhow::Result<()> {
    let has_table = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'")
        .fetch_optional(pool)
        .await?
        .is_some();

    let applied: HashSet<i64> = if has_table {
        sqlx::query("SELECT version FROM _sqlx_migrations WHERE success = 1")
            .fetch_all(pool)
            .await?
            .iter()
            .filter_map(|row| row.try_get::<i64, _>("version").ok())
            .collect()
    } else {
        HashSet::new()
    };

    println!("{:<8} {:<16} Name", "Status", "Version");
    for migration in migrator.iter() {
        let status = if applied.contains(&migration.version) { "applied" } else { "pending" };
        println!("{:<8} {:<16} {}", status, migration.version, migration.description);
    }

    Ok(())
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

async fn get_migrator() -> anyhow::Result<sqlx::migrate::Migrator> {
    // ./migrations when run from the repo root, else the crate's own folder
    let local = Path::new("./migrations");
    let path = if local.exists() {
        local.to_path_buf()
    } else {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")
    };

    let display = path.display().to_string();
    sqlx::migrate::Migrator::new(path)
        .await
        .with_context(|| format!("failed to load migrations from {display}"))
}
