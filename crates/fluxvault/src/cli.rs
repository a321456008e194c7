use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "fluxvault", version, about = "Deliver managed files from a keeper to application agents")]
pub struct Cli {
    /// Log level or filter directives (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Console log format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Also write rotating JSONL logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an agent next to an application
    Agent {
        /// Agent TOML configuration
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Run a keeper that polls the application's agents
    Keeper {
        /// Keeper TOML configuration
        #[arg(long, short)]
        config: PathBuf,
        /// Run a single polling cycle, print its report and exit
        #[arg(long)]
        once: bool,
    },
    /// Create (or show) the signing key for an account
    Keygen {
        /// Account name the key is stored under
        #[arg(long)]
        account: String,
        /// Key store directory
        #[arg(long, default_value = ".fluxvault/keys")]
        key_dir: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_keeper_once_with_global_flags() {
        let cli = Cli::try_parse_from([
            "fluxvault",
            "keeper",
            "--config",
            "keeper.toml",
            "--once",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        let Command::Keeper { config, once } = cli.command else {
            panic!("expected keeper command");
        };
        assert_eq!(config, PathBuf::from("keeper.toml"));
        assert!(once);
    }
}
