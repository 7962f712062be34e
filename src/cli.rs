use clap::{Parser, Subcommand};

/// Command-line options for Spool.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a new account via OAuth onboarding.
    AddAccount,
    /// One-shot sync: initial for new accounts, incremental otherwise.
    Sync {
        /// Only sync this account.
        #[arg(long)]
        email: Option<String>,
        /// Force the initial-sync path even if it already completed.
        #[arg(long)]
        initial: bool,
    },
    /// Poll all accounts on an interval until interrupted.
    Daemon,
}
