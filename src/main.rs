//! Composes SEBAK test networks across several remote Docker hosts.

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};

mod commands;
mod config;
mod dispatch;
mod error;
mod fleet;
mod keypair;
mod launch;
mod monitor;
mod probe;
mod registry;
mod runtime;
mod topology;
mod types;

use commands::{Level, LogsArgs, PartialFailure, RunArgs, DEFAULT_IMAGE};

#[derive(Parser, Debug)]
#[command(name = "network-composer")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level
    #[arg(long, global = true, value_enum, default_value_t = Level::Info)]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the node image on every host
    Build {
        config: PathBuf,
        /// Image tag to build
        #[arg(long, default_value = DEFAULT_IMAGE)]
        image: String,
        /// Build SEBAK from source (`Dockerfile.from-source`)
        #[arg(long)]
        source: bool,
        /// Remove the existing image first
        #[arg(long)]
        force: bool,
    },

    /// Compose and launch a network
    Run {
        config: PathBuf,
        /// Number of nodes
        #[arg(short = 'n', default_value_t = 3)]
        nodes: usize,
        /// Node image
        #[arg(long, default_value = DEFAULT_IMAGE)]
        image: String,
        /// Remove the existing fleet containers first
        #[arg(long)]
        force: bool,
        /// Log level of the nodes
        #[arg(long, value_enum, default_value_t = Level::Debug)]
        sebak_log_level: Level,
    },

    /// Stop every fleet container
    Stop { config: PathBuf },

    /// Remove every fleet container
    Remove { config: PathBuf },

    /// List the fleet containers
    List { config: PathBuf },

    /// Download the logs of every fleet container
    Logs {
        config: PathBuf,
        /// Defaults to a timestamped directory under the current one
        #[arg(long)]
        output_directory: Option<PathBuf>,
        /// Unix timestamp or a duration like `10m`
        #[arg(long)]
        since: Option<String>,
        /// Number of trailing lines or `all`
        #[arg(long, default_value = "all")]
        tail: String,
        /// Print the end of every log file
        #[arg(long)]
        verbose: bool,
    },

    /// Copy a path out of every fleet container
    Copy {
        config: PathBuf,
        source: String,
        output: PathBuf,
    },

    /// Query the status of every running node
    NodeInfo {
        config: PathBuf,
        #[arg(long, default_value = DEFAULT_IMAGE)]
        image: String,
        /// Print every response
        #[arg(long)]
        verbose: bool,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Build { .. } => "build",
            Command::Run { .. } => "run",
            Command::Stop { .. } => "stop",
            Command::Remove { .. } => "remove",
            Command::List { .. } => "list",
            Command::Logs { .. } => "logs",
            Command::Copy { .. } => "copy",
            Command::NodeInfo { .. } => "node-info",
        }
    }
}

async fn execute(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Build {
            config,
            image,
            source,
            force,
        } => commands::build(&config, &image, source, force).await,
        Command::Run {
            config,
            nodes,
            image,
            force,
            sebak_log_level,
        } => {
            let args = RunArgs {
                nodes,
                image,
                force,
                sebak_log_level,
            };
            commands::run(&config, args).await
        }
        Command::Stop { config } => commands::stop(&config).await,
        Command::Remove { config } => commands::remove(&config).await,
        Command::List { config } => commands::list(&config).await,
        Command::Logs {
            config,
            output_directory,
            since,
            tail,
            verbose,
        } => {
            let args = LogsArgs {
                output: output_directory,
                since,
                tail,
                verbose,
            };
            commands::logs(&config, args).await
        }
        Command::Copy {
            config,
            source,
            output,
        } => commands::copy(&config, &source, &output).await,
        Command::NodeInfo {
            config,
            image,
            verbose,
        } => commands::node_info(&config, &image, verbose).await,
    }
}

/// Exit status for an argument error.  Help and version requests keep
/// clap's status; everything else exits 1 like any other setup error.
fn exit_status(e: &clap::Error) -> i32 {
    match e.exit_code() {
        0 => 0,
        _ => 1,
    }
}

/// First argument naming a subcommand.
fn subcommand_in<I, S>(args: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let cli = Cli::command();
    args.into_iter()
        .skip(1)
        .find(|arg| cli.find_subcommand(arg.as_ref()).is_some())
        .map(|arg| arg.as_ref().to_string())
}

fn print_subcommand_help(name: &str) {
    let mut cli = Cli::command();
    if let Some(sub) = cli.find_subcommand_mut(name) {
        let _ = sub.print_help();
    }
}

/// Message printed for a failed command.  Partial failures were already
/// summarized by the command itself.
fn failure_message(e: &anyhow::Error) -> Option<String> {
    if e.downcast_ref::<PartialFailure>().is_some() {
        None
    } else {
        Some(format!("error: {:#}", e))
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let status = exit_status(&e);
            if status == 0 {
                e.exit();
            }
            let _ = e.print();
            if let Some(name) = subcommand_in(std::env::args()) {
                print_subcommand_help(&name);
            }
            std::process::exit(status);
        }
    };

    // RUST_LOG wins over --log-level.
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.log_level.filter().as_str()),
    )
    .init();

    let name = cli.command.name();
    if let Err(e) = execute(cli.command).await {
        if let Some(message) = failure_message(&e) {
            eprintln!("{}", message);
            print_subcommand_help(name);
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_errors_exit_with_one() {
        let e = Cli::try_parse_from(["network-composer", "run"]).unwrap_err();
        assert_eq!(exit_status(&e), 1);

        let args = ["network-composer", "run", "cfg.toml", "-n", "abc"];
        let e = Cli::try_parse_from(args).unwrap_err();
        assert_eq!(exit_status(&e), 1);
        assert_eq!(subcommand_in(args).as_deref(), Some("run"));
    }

    #[test]
    fn help_and_version_exit_with_zero() {
        let e = Cli::try_parse_from(["network-composer", "--help"]).unwrap_err();
        assert_eq!(exit_status(&e), 0);
        let e = Cli::try_parse_from(["network-composer", "--version"]).unwrap_err();
        assert_eq!(exit_status(&e), 0);
    }

    #[test]
    fn subcommand_is_found_after_global_flags() {
        let args = ["network-composer", "--log-level", "debug", "node-info"];
        assert_eq!(subcommand_in(args).as_deref(), Some("node-info"));
        assert_eq!(subcommand_in(["network-composer", "frobnicate"]), None);
    }

    #[test]
    fn partial_failures_are_not_reported_twice() {
        let partial: anyhow::Error = PartialFailure {
            what: "stop".into(),
            noun: "containers".into(),
            failed: 1,
            total: 3,
            targets: vec!["scn.0001".into()],
        }
        .into();
        assert_eq!(failure_message(&partial), None);

        let setup = anyhow::anyhow!("`docker-path` is not configured");
        assert_eq!(
            failure_message(&setup).as_deref(),
            Some("error: `docker-path` is not configured")
        );
    }
}
