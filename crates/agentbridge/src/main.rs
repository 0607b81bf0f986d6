mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "agentbridge",
    version,
    about = "Drive simulated agents and watch their telemetry"
)]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        env = "AGENTBRIDGE_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults_match_the_environment() {
        let cli = Cli::try_parse_from(["agentbridge", "client"]).expect("client args should parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.port, 10002);
        assert_eq!(args.agent, 1);
        assert_eq!(args.timeout, "5s");
        assert!(!args.verbose);
    }

    #[test]
    fn subscribe_takes_topic_and_count() {
        let cli = Cli::try_parse_from([
            "agentbridge",
            "--format",
            "raw",
            "subscribe",
            "--topic",
            "/agents/1",
            "--count",
            "3",
        ])
        .expect("subscribe args should parse");
        assert_eq!(cli.format, Some(OutputFormat::Raw));
        let Command::Subscribe(args) = cli.command else {
            panic!("expected subscribe subcommand");
        };
        assert_eq!(args.port, 10001);
        assert_eq!(args.topic, "/agents/1");
        assert_eq!(args.count, Some(3));
    }

    #[test]
    fn rejects_non_numeric_agent() {
        let err = Cli::try_parse_from(["agentbridge", "client", "--agent", "seven"])
            .expect_err("agent must be numeric");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn parses_serve_ports() {
        let cli = Cli::try_parse_from([
            "agentbridge",
            "serve",
            "--command-port",
            "0",
            "--telemetry-port",
            "0",
            "--agents",
            "2",
        ])
        .expect("serve args should parse");
        assert!(matches!(cli.command, Command::Serve(ref args) if args.agents == 2));
    }
}
