mod cli;
mod commands;
mod config;

use std::process;

use anyhow::Result;
use clap::Parser;
use headless_ais::{Error, GatewayError, LoginError};
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::commands::CommandExecutor;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let json = args.json;
    init_logging(args.verbose, args.quiet, json);

    if let Err(e) = run(args).await {
        let hint = login_error(&e).map(LoginError::user_message);
        if json {
            let error_json = serde_json::json!({
                "status": "error",
                "message": format!("{e:#}"),
                "hint": hint,
            });
            println!("{error_json}");
        } else {
            error!("Application error: {e:#}");
            eprintln!("Error: {e:#}");
            if let Some(hint) = hint {
                eprintln!("{hint}");
            }
        }
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = config::load(&args)?;

    if let Commands::Config = args.command {
        println!("{}", config::show(&config)?);
        return Ok(());
    }

    let executor = CommandExecutor::new(config, args.json).await?;
    match args.command {
        Commands::Remember { account, password } => executor.remember(&account, password).await?,
        Commands::Login => executor.login().await?,
        Commands::Fetch {
            path,
            params,
            output,
            retry,
        } => {
            executor
                .fetch(&path, &params, output.as_deref(), retry)
                .await?
        }
        Commands::Secondary { system, kind } => executor.secondary(system, kind).await?,
        Commands::Logout => executor.logout().await?,
        Commands::Config => {}
    }
    Ok(())
}

/// The login failure behind `e`, if any.
fn login_error(e: &anyhow::Error) -> Option<&LoginError> {
    if let Some(login) = e.downcast_ref::<LoginError>() {
        return Some(login);
    }
    let gateway = match e.downcast_ref::<GatewayError>() {
        Some(gateway) => Some(gateway),
        None => match e.downcast_ref::<Error>() {
            Some(Error::Login(login)) => return Some(login),
            Some(Error::Gateway(gateway)) => Some(gateway),
            _ => None,
        },
    };
    match gateway {
        Some(GatewayError::Login(login)) => Some(login),
        _ => None,
    }
}

fn init_logging(verbose: bool, quiet: bool, json: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("headless_ais=debug,ais_cli=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("headless_ais=info,ais_cli=info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_level(verbose)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
