//! ksu-bridge - run module WebUI bridge calls from a terminal
//!
//! Every subcommand goes through the same bridge a module page uses, so the
//! output mirrors what the page would receive.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ksu_webui_lib::bridge::KsuBridge;
use ksu_webui_lib::config::{BridgeConfig, ShellConfig};
use ksu_webui_lib::dispatch::{ConsoleFormat, ConsoleSurface, ResultDispatcher};
use ksu_webui_lib::exec::JobOutcome;
use ksu_webui_lib::web_server::{self, WebState};

/// Privileged command bridge for module WebUIs
#[derive(Parser, Debug)]
#[command(name = "ksu-bridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to <config dir>/ksu-webui/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Module directory the calls are made on behalf of
    #[arg(long, global = true, conflicts_with = "module")]
    module_dir: Option<PathBuf>,

    /// Module id, resolved under the configured modules root
    #[arg(short, long, global = true)]
    module: Option<String>,

    /// Use a plain `sh` instead of the su binary
    #[arg(long, global = true)]
    unprivileged: bool,

    /// How asynchronous events are printed
    #[arg(long, value_enum, default_value_t = OutputFormat::Plain, global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command to completion
    Exec {
        command: String,
        #[command(flatten)]
        options: OptionArgs,
    },
    /// Run a command and stream its output until it exits
    Spawn {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        #[command(flatten)]
        options: OptionArgs,
        /// Callback token the events are addressed to
        #[arg(long, default_value = "cli")]
        token: String,
    },
    /// Print the module's info object
    ModuleInfo,
    /// Kernel patch modules
    Kpm {
        #[command(subcommand)]
        action: KpmCommand,
    },
    /// Serve the module's webroot with the bridge over HTTP
    Serve {
        /// Listen address (defaults to [webui] bind)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
}

#[derive(Subcommand, Debug)]
enum KpmCommand {
    /// List every KPM
    List,
    /// Send control arguments to a KPM
    Control { name: String, args: String },
}

#[derive(clap::Args, Debug)]
struct OptionArgs {
    /// Working directory for the command
    #[arg(long)]
    cwd: Option<String>,

    /// Environment variable as NAME=VALUE, repeatable
    #[arg(short, long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,
}

impl OptionArgs {
    fn to_json(&self) -> Option<String> {
        if self.cwd.is_none() && self.env.is_empty() {
            return None;
        }
        let env: Map<String, Value> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Some(json!({ "cwd": self.cwd, "env": env }).to_string())
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
    Script,
}

impl From<OutputFormat> for ConsoleFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Plain => ConsoleFormat::Plain,
            OutputFormat::Json => ConsoleFormat::Json,
            OutputFormat::Script => ConsoleFormat::Script,
        }
    }
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got `{}`", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = BridgeConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if cli.unprivileged {
        config.shell = ShellConfig::unprivileged();
    }

    let module_dir = match (&cli.module_dir, &cli.module) {
        (Some(dir), _) => dir.clone(),
        (None, Some(id)) => config.modules.module_dir(id),
        (None, None) => std::env::current_dir().context("No module directory given")?,
    };

    if let Command::Serve { bind } = &cli.command {
        let addr = match bind {
            Some(addr) => *addr,
            None => config
                .webui
                .bind
                .parse()
                .with_context(|| format!("Invalid bind address {}", config.webui.bind))?,
        };
        let state = WebState::new(&config, &module_dir);
        web_server::serve(state, addr).await?;
        return Ok(());
    }

    let surface = Arc::new(ConsoleSurface::new(cli.format.into()));
    let (dispatcher, _consumer) = ResultDispatcher::start(surface);
    let bridge = KsuBridge::new(&config, &module_dir, dispatcher);

    let code = run(&bridge, cli.command, cli.format).await;
    bridge.shutdown().await;
    std::process::exit(code?);
}

async fn run(bridge: &KsuBridge, command: Command, format: OutputFormat) -> Result<i32> {
    match command {
        Command::Exec { command, options } => {
            let options = options.to_json();
            let result = bridge.exec_with_options(&command, options.as_deref()).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string(&result)?),
                OutputFormat::Plain | OutputFormat::Script => {
                    if !result.stdout.is_empty() {
                        println!("{}", result.stdout);
                    }
                    if !result.stderr.is_empty() {
                        eprintln!("{}", result.stderr);
                    }
                }
            }
            Ok(result.exit_code)
        }
        Command::Spawn {
            command,
            args,
            options,
            token,
        } => {
            let args = serde_json::to_string(&args)?;
            let options = options.to_json();
            let job = bridge
                .spawn(&command, &args, options.as_deref(), &token)
                .await?;
            info!("Started job {}", job.job_id);

            let outcome = tokio::select! {
                outcome = job.wait() => outcome,
                _ = tokio::signal::ctrl_c() => {
                    bridge.cancel(&token);
                    JobOutcome::Cancelled
                }
            };
            bridge.dispatcher().flush().await;

            Ok(match outcome {
                JobOutcome::Exited(code) => code,
                JobOutcome::Lost => -1,
                JobOutcome::Cancelled => 130,
            })
        }
        Command::ModuleInfo => {
            println!("{}", bridge.module_info().await);
            Ok(0)
        }
        Command::Kpm { action } => match action {
            KpmCommand::List => {
                println!("{}", bridge.list_all_kpm().await?);
                Ok(0)
            }
            KpmCommand::Control { name, args } => {
                let code = bridge.control_kpm(&name, &args).await?;
                println!("{}", code);
                Ok(code)
            }
        },
        Command::Serve { .. } => bail!("serve is handled before the bridge is built"),
    }
}
