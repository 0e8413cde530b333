//! `longitudinal-report`: generate the minimal pipe-delimited essence
//! report for one reportable region (C10, §4.9).

use std::process::ExitCode;

use clap::Parser;
use longitudinal::db;
use longitudinal::report::{self, ReportOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "longitudinal-report")]
#[command(version, about = "Generate the minimal longitudinal surveillance report")]
struct Args {
    /// Mart database name
    database: String,

    /// Reportable region to report on
    region: String,

    #[arg(long, value_name = "HOST", default_value = "localhost")]
    host: String,

    #[arg(long, value_name = "PORT", default_value_t = 5432)]
    port: u16,

    #[arg(long, value_name = "USER", default_value = "longitudinal")]
    user: String,

    #[arg(long, value_name = "PASSWORD", default_value = "")]
    password: String,

    /// Not ported upstream; always fails (§9)
    #[arg(long)]
    vitals: bool,
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

    let options = ReportOptions { include_vitals: args.vitals };
    match report::run(&mart, &args.region, &options).await {
        Ok(text) => {
            print!("{text}");
            ExitCode::SUCCESS
        },
        Err(err) => {
            tracing::error!(error = %err, "report generation failed");
            ExitCode::FAILURE
        },
    }
}
