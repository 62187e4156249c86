use std::path::PathBuf;

use clap::{Parser, Subcommand};
use headless_ais::{DownstreamKind, SecondarySystem};

#[derive(Parser, Debug)]
#[command(
    name = "ais",
    version,
    about = "Headless sign-in and authenticated fetches for the NTHU academic information system"
)]
pub struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "AIS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the Academic System base URL
    #[arg(long, global = true, env = "AIS_BASE_URL")]
    pub base_url: Option<String>,

    /// Override the CAPTCHA OCR endpoint
    #[arg(long, global = true, env = "AIS_OCR_ENDPOINT")]
    pub ocr_endpoint: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// JSON logs and JSON output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Encrypt and store the account credential on this device
    Remember {
        /// Student or staff account
        account: String,

        /// Password; read from stdin when omitted
        #[arg(long, env = "AIS_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Sign in with the stored credential
    Login,

    /// Fetch an Academic System page with the current session
    Fetch {
        /// Path relative to the base URL, e.g. JH/6/6.2/6.2.9/JH629001.php
        path: String,

        /// Extra query parameter as key=value, repeatable
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Write the decoded page here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Retry transient failures with backoff
        #[arg(long)]
        retry: bool,
    },

    /// Exchange the session for a secondary-system token
    Secondary {
        /// learning_platform (elearn) or dormitory (dorm)
        system: SecondarySystem,

        /// oauth_code, access_token or platform_cookie
        #[arg(default_value = "platform_cookie")]
        kind: DownstreamKind,
    },

    /// Drop the session and delete the stored credential
    #[command(alias = "forget")]
    Logout,

    /// Print the effective configuration
    Config,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw}"))
}
