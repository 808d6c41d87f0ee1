//! Logging for Vertex Swarm tools.
//!
//! [`LogArgs`] is flattened into a binary's CLI; [`init_logging`] installs
//! the global `tracing` subscriber it describes.

use clap::Args;
use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Logging configuration.
#[derive(Debug, Args, Clone, Default, Serialize, Deserialize)]
#[command(next_help_heading = "Logging")]
#[serde(default)]
pub struct LogArgs {
    /// Silence all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    #[serde(skip)]
    pub verbosity: u8,

    /// Log filter directives (e.g., "vertex_swarm_storer=trace").
    #[arg(long = "log.filter", value_name = "DIRECTIVE", global = true)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Use JSON format for log output.
    #[arg(long = "log.json", global = true)]
    pub json: bool,
}

impl LogArgs {
    /// Builds the filter:
    /// 1. `--quiet` shows errors only
    /// 2. otherwise `RUST_LOG` if set, else a level from the verbosity count
    /// 3. `--log.filter` directives are added on top
    pub fn env_filter(&self) -> Result<EnvFilter> {
        if self.quiet {
            return Ok(EnvFilter::new("error"));
        }

        let level = match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let mut filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(directives) if self.verbosity == 0 => EnvFilter::new(directives),
            _ => EnvFilter::new(level),
        };

        if let Some(custom) = &self.filter {
            for directive in custom.split(',').filter(|d| !d.trim().is_empty()) {
                let directive = directive
                    .trim()
                    .parse()
                    .map_err(|err| eyre!("invalid log directive {directive:?}: {err}"))?;
                filter = filter.add_directive(directive);
            }
        }
        Ok(filter)
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(args: &LogArgs) -> Result<()> {
    let filter = args.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if args.json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result.map_err(|err| eyre!("failed to install log subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        logs: LogArgs,
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from(["test", "-vv", "--log.filter", "redb=warn", "--log.json"]);
        assert_eq!(cli.logs.verbosity, 2);
        assert_eq!(cli.logs.filter.as_deref(), Some("redb=warn"));
        assert!(cli.logs.json);
        assert!(!cli.logs.quiet);
    }

    #[test]
    fn test_quiet_filter() {
        let args = LogArgs {
            quiet: true,
            ..Default::default()
        };
        assert_eq!(args.env_filter().unwrap().to_string(), "error");
    }

    #[test]
    fn test_custom_directives() {
        let args = LogArgs {
            verbosity: 1,
            filter: Some("vertex_swarm_storer=trace, redb=warn".into()),
            ..Default::default()
        };
        let filter = args.env_filter().unwrap().to_string();
        assert!(filter.contains("vertex_swarm_storer=trace"));
        assert!(filter.contains("redb=warn"));
    }

    #[test]
    fn test_invalid_directive() {
        let args = LogArgs {
            filter: Some("vertex=notalevel".into()),
            ..Default::default()
        };
        assert!(args.env_filter().is_err());
    }
}
