use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "fieldvault",
    about = "Field-level encrypted record store",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Check that the master key, key vault and store are reachable.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Manage users.
    #[command(subcommand)]
    User(UserCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
    /// Print the effective connection settings.
    Show,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Register a new user.
    Add {
        username: String,
        email: String,
        /// Full name (quote it if it contains spaces).
        full_name: String,
    },
    /// List users.
    List {
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Look a user up by email or username.
    Find {
        #[arg(long, conflicts_with = "username", required_unless_present = "username")]
        email: Option<String>,
        #[arg(long)]
        username: Option<String>,
    },
    /// Change a user's email or full name.
    Update {
        id: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        full_name: Option<String>,
    },
    /// Soft-delete a user.
    Delete { id: String },
}
