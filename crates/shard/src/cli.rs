//! Command-line interface handling for the shard server.
//!
//! This module provides command-line argument parsing using the `clap` crate.
//! Every option overrides the matching setting of the configuration file.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the listen endpoints
    pub listen: Vec<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Shorthand for `--log-level debug`
    pub debug: bool,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Optional override for the connection limit
    pub max_connections: Option<usize>,
}

fn command() -> Command {
    Command::new("shard")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Shard server network core")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("shard.toml"),
        )
        .arg(
            Arg::new("listen")
                .short('b')
                .long("listen")
                .value_name("ADDRESS")
                .help("Endpoint to listen on, repeatable (e.g., 0.0.0.0:2593)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("max-connections")
                .short('m')
                .long("max-connections")
                .value_name("COUNT")
                .help("Maximum number of concurrent connections")
                .value_parser(clap::value_parser!(usize)),
        )
}

impl CliArgs {
    /// Parses the process arguments. Exits with usage on invalid input.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    /// Parses an explicit argument list.
    #[cfg(test)]
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("shard.toml")),
            listen: matches
                .get_many::<String>("listen")
                .map(|values| values.cloned().collect())
                .unwrap_or_default(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            debug: matches.get_flag("debug"),
            json_logs: matches.get_flag("json-logs"),
            max_connections: matches.get_one::<usize>("max-connections").copied(),
        }
    }
}
