//! Command-line surface (spec.md §6): `--token`, `-c/--config`,
//! `--validate`, `--version`, `--log-level`, and a mutually-exclusive
//! `--log-file PATH | --log-stdout` pair.

use std::path::PathBuf;

use clap::Parser;
use secrecy::SecretString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "premiscaled", version, about = "PremiScale on-premises VM autoscaling controller")]
pub struct Cli {
    /// Platform registration token. Overrides `controller.platform.token` in config.
    #[arg(long, env = "PREMISCALE_TOKEN")]
    pub token: Option<String>,

    #[arg(short, long, default_value = "/etc/premiscale/config.yaml")]
    pub config: PathBuf,

    /// Load and validate the config, then exit 0 (valid) or 2 (invalid), without starting the controller.
    #[arg(long)]
    pub validate: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, group = "log_target")]
    pub log_file: Option<PathBuf>,

    #[arg(long, group = "log_target")]
    pub log_stdout: bool,
}

impl Cli {
    pub fn token_override(&self) -> Option<SecretString> {
        self.token.clone().map(SecretString::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["premiscaled", "-c", "/tmp/config.yaml"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/config.yaml"));
        assert!(!cli.validate);
        assert_eq!(cli.log_level, LogLevel::Info);
    }

    #[test]
    fn log_file_and_log_stdout_are_mutually_exclusive() {
        let result = Cli::try_parse_from(["premiscaled", "--log-file", "/tmp/a.log", "--log-stdout"]);
        assert!(result.is_err());
    }

    #[test]
    fn validate_and_version_flags_parse() {
        let cli = Cli::parse_from(["premiscaled", "--validate", "--log-level", "debug"]);
        assert!(cli.validate);
        assert_eq!(cli.log_level, LogLevel::Debug);
    }
}
