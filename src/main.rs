mod app_dir;
mod config;
mod discovery;
mod engine;
mod engine_files;
mod event_log;
mod global_engine;
mod launcher;
mod lifecycle;
mod logger;
mod server;
mod session_dir;
mod watchdog;
mod watchdog_process;
mod watchdog_protocol;
mod win_env;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::watchdog_protocol::{BASE_DIR_FLAG, SERVER_INSTANCE_ID_FLAG, WATCHDOG_MODE_FLAG};

enum CliCommand {
    RunServer(Config),
    RunWatchdog {
        base_dir: String,
        server_instance_id: String,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // Writes to stdout/stderr can raise SIGPIPE once the client closes its
    // read end; surface those as broken-pipe errors instead of dying.
    ignore_sigpipe();

    match parse_cli_args()? {
        CliCommand::RunWatchdog {
            base_dir,
            server_instance_id,
        } => watchdog::run(&base_dir, &server_instance_id),
        CliCommand::RunServer(config) => {
            event_log::initialize(config.debug_events_dir.clone(), "server")?;
            server::run(config).await
        }
    }
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn parse_cli_args() -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new();
    let mut config = Config::from_env();
    let mut watchdog_mode = false;

    while let Some(arg) = parser.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            _ if arg == format!("--{WATCHDOG_MODE_FLAG}") => {
                watchdog_mode = true;
            }
            _ if flag_matches(&arg, BASE_DIR_FLAG) => {
                config.base_dir = flag_value(&arg, BASE_DIR_FLAG, &mut parser)?;
            }
            _ if flag_matches(&arg, SERVER_INSTANCE_ID_FLAG) => {
                config.server_instance_id =
                    flag_value(&arg, SERVER_INSTANCE_ID_FLAG, &mut parser)?;
            }
            _ if flag_matches(&arg, "preferred-engine-root") => {
                config.preferred_engine_root =
                    flag_value(&arg, "preferred-engine-root", &mut parser)?;
            }
            _ if flag_matches(&arg, "starting-dir") => {
                config.preferred_starting_directory =
                    flag_value(&arg, "starting-dir", &mut parser)?;
            }
            _ if flag_matches(&arg, "shutdown-timeout-ms") => {
                let value = flag_value(&arg, "shutdown-timeout-ms", &mut parser)?;
                let millis: u64 = value
                    .parse()
                    .map_err(|_| format!("invalid --shutdown-timeout-ms value: {value}"))?;
                config.shutdown_timeout = Some(Duration::from_millis(millis));
            }
            _ if flag_matches(&arg, "debug-events-dir") => {
                let value = flag_value(&arg, "debug-events-dir", &mut parser)?;
                config.debug_events_dir = Some(PathBuf::from(value));
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }

    if watchdog_mode {
        return Ok(CliCommand::RunWatchdog {
            base_dir: config.base_dir,
            server_instance_id: config.server_instance_id,
        });
    }
    Ok(CliCommand::RunServer(config))
}

fn flag_matches(arg: &str, flag: &str) -> bool {
    arg == format!("--{flag}") || arg.starts_with(&format!("--{flag}="))
}

fn flag_value(
    arg: &str,
    flag: &str,
    parser: &mut ArgParser,
) -> Result<String, Box<dyn std::error::Error>> {
    if let Some((_, value)) = arg.split_once('=') {
        if value.is_empty() {
            return Err(format!("missing value for --{flag}").into());
        }
        return Ok(value.to_string());
    }
    parser.next_value(flag)
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for --{flag}").into())
    }
}

fn print_usage() {
    println!(
        "mcp-engine-server: MCP server exposing a local computation engine over stdio

USAGE:
  mcp-engine-server [OPTIONS]

OPTIONS:
  --base-dir <path>              Working directory for server state (default: system temp)
  --server-instance-id <id>      Stable id for this server instance (default: auto-allocated)
  --preferred-engine-root <path> Use this engine installation instead of discovery
  --starting-dir <path>          Directory the engine starts in (default: user home)
  --shutdown-timeout-ms <ms>     Bound on graceful shutdown (default: 30000)
  --debug-events-dir <path>      Write a JSONL event log into this directory
  --watchdog-mode                Run as the internal watchdog process
  -h, --help                     Show this help"
    );
}
