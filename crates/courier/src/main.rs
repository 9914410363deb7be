//! Courier agent launcher
//!
//! - `run`: start the trigger manager and poll until SIGINT/SIGTERM
//! - `triggers`, `commands`: inspect the local store while the agent is down
//! - `config`: print the effective agent configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier::{InMemoryJobManager, StopSignal, TriggerManager, TriggerProfileDb};
use courier_conf::{AgentConf, TriggerProfile};
use courier_db::{CommandDb, CommandEntity, Db, SqliteDb};
use courier_logging::LogConfig;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How often the main thread reports liveness while running.
const STATUS_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "courier", about = "Local agent that turns filesystem activity into jobs")]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Agent home (configuration, local store, logs)
    #[arg(long, global = true, env = "COURIER_HOME")]
    home: Option<PathBuf>,

    /// Override a configuration key, e.g. `--set trigger.fetch.interval=2`
    #[arg(long = "set", global = true, value_name = "KEY=VALUE", value_parser = parse_key_val)]
    overrides: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the agent and run until interrupted
    Run {
        /// Trigger profile (JSON or TOML) to submit at startup; repeatable
        #[arg(long = "trigger", value_name = "FILE")]
        triggers: Vec<PathBuf>,
    },

    /// Inspect persisted trigger profiles
    Triggers {
        #[command(subcommand)]
        action: TriggerAction,
    },

    /// Inspect stored commands
    Commands {
        #[command(subcommand)]
        action: CommandAction,
    },

    /// Print the effective agent configuration
    Config,
}

#[derive(Subcommand, Debug)]
enum TriggerAction {
    /// List persisted trigger profiles
    List {
        /// Print each profile as flat JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a persisted trigger profile
    Remove {
        /// Trigger id (`job.id`)
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum CommandAction {
    /// List stored commands
    List {
        /// Only commands still waiting for an ack
        #[arg(long)]
        unacked: bool,
    },
}

fn parse_key_val(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{}`", raw));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn load_conf(home: &Path, overrides: &[(String, String)]) -> AgentConf {
    let mut conf = AgentConf::load_home(home);
    for (key, value) in overrides {
        conf.set(key.as_str(), value.as_str());
    }
    conf
}

fn open_store(conf: &AgentConf) -> Result<Arc<SqliteDb>> {
    let path = conf.local_store_path();
    let db = SqliteDb::open(&path).with_context(|| {
        format!(
            "Failed to open local store {} (is another agent running?)",
            path.display()
        )
    })?;
    Ok(Arc::new(db))
}

fn run_agent(conf: AgentConf, trigger_files: &[PathBuf]) -> Result<()> {
    let shutdown = Arc::new(StopSignal::new());
    install_signal_handlers(shutdown.clone())?;

    let conf = Arc::new(conf);
    let store = open_store(&conf)?;
    let db: Arc<dyn Db> = store.clone();
    let job_manager = Arc::new(InMemoryJobManager::new());
    let manager = Arc::new(TriggerManager::new(conf.clone(), job_manager.clone(), db));

    info!(
        home = %conf.home().display(),
        store = %conf.local_store_path().display(),
        max_triggers = conf.trigger_max_running_num(),
        "starting courier agent"
    );
    manager.start().context("Failed to start trigger manager")?;

    for file in trigger_files {
        let profile = TriggerProfile::from_file(file)
            .with_context(|| format!("Failed to read trigger profile {}", file.display()))?;
        if manager.submit_trigger(profile) {
            info!(file = %file.display(), "trigger submitted");
        } else {
            warn!(file = %file.display(), "trigger rejected");
        }
    }

    while !shutdown.wait_timeout(STATUS_INTERVAL) {
        info!(
            triggers = manager.active_count(),
            jobs = job_manager.len(),
            "agent status"
        );
    }

    info!("Shutting down...");
    manager.stop();
    store.close().context("Failed to close local store")?;
    info!("Shutdown complete");
    Ok(())
}

fn install_signal_handlers(shutdown: Arc<StopSignal>) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        std::thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!(signal = sig, "received signal, initiating shutdown");
                    shutdown.stop();
                }
            })?;
    }

    #[cfg(windows)]
    {
        ctrlc::set_handler(move || {
            info!("Received Ctrl+C, initiating shutdown...");
            shutdown.stop();
        })?;
    }

    Ok(())
}

fn list_triggers(conf: &AgentConf, json: bool) -> Result<()> {
    let store = open_store(conf)?;
    let profiles = TriggerProfileDb::new(store.clone()).triggers()?;
    for profile in &profiles {
        if json {
            println!("{}", profile.to_json_str());
        } else {
            println!(
                "{}\t{}",
                profile.trigger_id().unwrap_or_default(),
                profile.trigger_kind().unwrap_or_default()
            );
        }
    }
    if !json {
        eprintln!("{} trigger(s)", profiles.len());
    }
    store.close()?;
    Ok(())
}

fn remove_trigger(conf: &AgentConf, id: &str) -> Result<()> {
    let store = open_store(conf)?;
    let removed = TriggerProfileDb::new(store.clone()).delete_trigger(id)?;
    store.close()?;
    if removed {
        println!("Removed trigger {}", id);
        Ok(())
    } else {
        anyhow::bail!("No persisted trigger with id {}", id)
    }
}

fn list_commands(conf: &AgentConf, unacked_only: bool) -> Result<()> {
    let store = open_store(conf)?;
    let commands = CommandDb::new(store.clone());
    let mut listed = commands.unacked_commands()?;
    if !unacked_only {
        listed.extend(commands.acked_commands()?);
    }
    for command in &listed {
        print_command(command);
    }
    store.close()?;
    Ok(())
}

fn print_command(command: &CommandEntity) {
    println!(
        "{}\ttask={}\tversion={}\tresult={}\tacked={}\tdelivered={}",
        command.id,
        command.task_id,
        command.version,
        command.command_result,
        command.acked,
        command.delivery_time.to_rfc3339()
    );
}

fn run(cli: Cli, home: PathBuf) -> Result<()> {
    let conf = load_conf(&home, &cli.overrides);
    match cli.command {
        Commands::Run { triggers } => run_agent(conf, &triggers),
        Commands::Triggers { action } => match action {
            TriggerAction::List { json } => list_triggers(&conf, json),
            TriggerAction::Remove { id } => remove_trigger(&conf, &id),
        },
        Commands::Commands { action } => match action {
            CommandAction::List { unacked } => list_commands(&conf, unacked),
        },
        Commands::Config => {
            for line in conf.storage_list() {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let home = cli.home.clone().unwrap_or_else(courier_logging::courier_home);

    let _log_guard = match courier_logging::init_logging(LogConfig {
        app_name: "courier",
        verbose: cli.verbose,
        home: &home,
    }) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: failed to initialize logging: {:#}", e);
            None
        }
    };

    match run(cli, home) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use courier_conf::keys;
    use tempfile::TempDir;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("trigger.fetch.interval = 2").unwrap(),
            ("trigger.fetch.interval".to_string(), "2".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_overrides_win_over_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("agent.properties"), "trigger.max.running.num=3\n").unwrap();

        let conf = load_conf(
            tmp.path(),
            &[(keys::TRIGGER_MAX_RUNNING_NUM.to_string(), "9".to_string())],
        );
        assert_eq!(conf.trigger_max_running_num(), 9);
    }

    #[test]
    fn test_run_subcommand_collects_trigger_files() {
        let cli = Cli::try_parse_from([
            "courier",
            "--set",
            "a=b",
            "run",
            "--trigger",
            "one.json",
            "--trigger",
            "two.toml",
        ])
        .unwrap();
        assert_eq!(cli.overrides, vec![("a".to_string(), "b".to_string())]);
        match cli.command {
            Commands::Run { triggers } => {
                assert_eq!(triggers, vec![PathBuf::from("one.json"), PathBuf::from("two.toml")])
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
