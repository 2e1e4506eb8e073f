//! CLI surface for backchannel.

use std::ffi::OsString;

use clap::{ArgAction, Parser, Subcommand};

use crate::{broker, config};

#[derive(Parser, Debug)]
#[command(
    name = "bch",
    version,
    about = "Local clarification/yap relay between AI agents and terminals",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a standalone broker until interrupted.
    Broker {
        /// Listen port (default from config).
        #[arg(long)]
        port: Option<u16>,

        /// Listen host (default from config).
        #[arg(long)]
        host: Option<String>,
    },
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli) -> crate::Result<()> {
    match cli.command {
        Commands::Broker { port, host } => {
            let mut settings = config::load_or_init().broker;
            if let Some(port) = port {
                settings.port = port;
            }
            if let Some(host) = host {
                settings.host = host;
            }
            broker::run(&settings)?;
            Ok(())
        }
    }
}
