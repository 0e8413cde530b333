//! `longitudinal-static-data`: dump or load the mart's static
//! dimensions (facility, admission source, disposition, reportable
//! region) to/from a YAML file (C8, §4.8).

use std::fs;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use longitudinal::locks::DimensionLocks;
use longitudinal::{db, static_data};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "longitudinal-static-data")]
#[command(version, about = "Import/export the longitudinal mart's static dimensions")]
struct Args {
    /// Mart database name
    database: String,

    #[arg(long, value_name = "HOST", default_value = "localhost")]
    host: String,

    #[arg(long, value_name = "PORT", default_value_t = 5432)]
    port: u16,

    #[arg(long, value_name = "USER", default_value = "longitudinal")]
    user: String,

    #[arg(long, value_name = "PASSWORD", default_value = "")]
    password: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the mart's static dimensions to a YAML file
    Dump {
        /// Output path; `-` writes to stdout
        path: String,
    },
    /// Read and upsert static dimensions from a YAML file
    Load {
        /// Input path; `-` reads from stdin
        path: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let cfg = longitudinal::config::LongitudinalConfig {
        database_user: args.user,
        database_password: args.password,
        database_host: args.host,
        warehouse_port: args.port,
        mart_port: args.port,
        num_workers: 1,
    };

    let mart = match db::connect(&cfg, &args.database, args.port).await {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to mart database");
            return ExitCode::FAILURE;
        },
    };

    let result = match args.command {
        Command::Dump { path } => run_dump(&mart, &path).await,
        Command::Load { path } => run_load(&mart, &path).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "static data command failed");
            ExitCode::FAILURE
        },
    }
}

async fn run_dump(mart: &sqlx::PgPool, path: &str) -> anyhow::Result<()> {
    let yaml = static_data::dump(mart).await?;
    if path == "-" {
        print!("{yaml}");
    } else {
        fs::write(path, yaml)?;
    }
    Ok(())
}

async fn run_load(mart: &sqlx::PgPool, path: &str) -> anyhow::Result<()> {
    let yaml = if path == "-" {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(path)?
    };
    let locks = DimensionLocks::new();
    static_data::load(mart, &locks, &yaml).await?;
    Ok(())
}
