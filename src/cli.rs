//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "edgeacl")]
#[command(author, version, about = "ACL sync and firewall enforcement for edge nodes")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sync daemon
    Run,

    /// Check which local lists match an IP
    Check {
        /// IP address to check
        ip: String,
    },

    /// Print the CIDR blocks covering an address range
    Cidr {
        /// First address of the range
        from: String,
        /// Last address of the range (inclusive)
        to: String,
        /// Skip blocks longer than this prefix
        #[arg(long)]
        max_prefix_len: Option<u8>,
    },

    /// Show version
    Version,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses_help() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_version_command() {
        let cli = Cli::try_parse_from(["edgeacl", "version"]).unwrap();
        assert!(matches!(cli.command, Commands::Version));
    }

    #[test]
    fn test_cli_run_defaults() {
        let cli = Cli::try_parse_from(["edgeacl", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!cli.verbose);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_cli_check_command() {
        let cli = Cli::try_parse_from(["edgeacl", "check", "192.168.1.1"]).unwrap();
        match cli.command {
            Commands::Check { ip } => assert_eq!(ip, "192.168.1.1"),
            _ => panic!("Expected Check command"),
        }
    }

    #[test]
    fn test_cli_cidr_command() {
        let cli = Cli::try_parse_from([
            "edgeacl",
            "cidr",
            "10.0.0.0",
            "10.0.3.255",
            "--max-prefix-len",
            "24",
        ])
        .unwrap();
        match cli.command {
            Commands::Cidr {
                from,
                to,
                max_prefix_len,
            } => {
                assert_eq!(from, "10.0.0.0");
                assert_eq!(to, "10.0.3.255");
                assert_eq!(max_prefix_len, Some(24));
            }
            _ => panic!("Expected Cidr command"),
        }
    }

    #[test]
    fn test_cli_global_flags() {
        let cli =
            Cli::try_parse_from(["edgeacl", "run", "--config", "/tmp/e.yaml", "--verbose"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/e.yaml"));
        assert!(cli.verbose);
    }
}
