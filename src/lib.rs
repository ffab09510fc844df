pub mod config;
pub mod logging;
pub mod nas;

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;

use config::{Config, ConfigError, NotificationConfig};
use nas::{
    Collaborators, DiscordNotifier, LogNotifier, MagicPacketWaker, NetworkWaker, Notifier,
    Orchestrator, PingProbe, RsyncExecutor, RunResult, SleepSignal, SshReadinessProbe,
    SshShutdown, SystemClock,
};

/// Exit status for configuration and usage errors (matches clap's own).
pub const EXIT_CONFIG_ERROR: i32 = 2;

/// Exit status for any other error outside a pipeline run.
pub const EXIT_INTERNAL_ERROR: i32 = 1;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "nas-wake-sync",
    version,
    long_version = long_version(),
    about = "Wake a NAS, wait until it accepts SSH, rsync a directory to it, and report the outcome"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Wake the NAS, sync, notify, and optionally shut it down again
    Run {
        /// Config file (defaults to $NAS_WAKE_SYNC_CONFIG, then the platform config dir)
        config: Option<PathBuf>,

        /// Leave the NAS running after a successful sync
        #[arg(long, default_value_t = false)]
        no_shutdown: bool,
    },
    /// Load and validate a config file, then print what would be used
    CheckConfig {
        config: Option<PathBuf>,

        /// Print the validated config as JSON
        #[arg(long)]
        json: bool,
    },
    /// Only send the Wake-on-LAN packet
    Wake { config: Option<PathBuf> },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

/// Parse arguments, execute the command, and return the process exit status.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            no_shutdown,
        } => {
            let config = load_config(config)?;
            let _guard = logging::init(&config.log)?;
            let result = run_pipeline(&config, no_shutdown);
            print_result(&result);
            Ok(result.exit_code())
        }
        Commands::CheckConfig { config, json } => {
            let config = load_config(config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print_config_summary(&config);
            }
            Ok(0)
        }
        Commands::Wake { config } => {
            let config = load_config(config)?;
            logging::init_stderr(&config.log.log_level);
            let target = &config.target;
            MagicPacketWaker::new(target.broadcast, target.wol_port)
                .wake(&target.mac)
                .context("sending wake packet")?;
            Ok(0)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "nas-wake-sync", &mut std::io::stdout());
            Ok(0)
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(0)
        }
    }
}

/// Exit status for an error that escaped [`run`].
pub fn error_exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG_ERROR
    } else {
        EXIT_INTERNAL_ERROR
    }
}

fn load_config(explicit: Option<PathBuf>) -> Result<Config, ConfigError> {
    let path = config::resolve_config_path(explicit)?;
    Config::load(&path)
}

/// Wire the real capabilities and run the pipeline once.
pub fn run_pipeline(config: &Config, no_shutdown: bool) -> RunResult {
    let target = &config.target;

    let clock = SystemClock;
    let waker = MagicPacketWaker::new(target.broadcast, target.wol_port);
    let ping = PingProbe::new(target.ping_timeout);
    let ssh = SshReadinessProbe::new(target.ssh_connect_timeout);
    let rsync = RsyncExecutor::new(&config.sync, target.credential.clone());
    let shutdown = SshShutdown::new(
        &target.ip,
        target.credential.clone(),
        &target.shutdown_command,
        target.ssh_connect_timeout,
    );
    let notifier = build_notifier(&config.notification);

    let parts = Collaborators {
        clock: &clock,
        waker: &waker,
        reachability: &ping,
        readiness: &ssh,
        executor: &rsync,
        sleeper: (!no_shutdown).then_some(&shutdown as &dyn nas::DeviceSleeper),
        notifier: notifier.as_ref(),
    };

    Orchestrator::new(target, &config.sync, parts).run()
}

fn build_notifier(config: &NotificationConfig) -> Box<dyn Notifier> {
    if config.enabled
        && let Some(url) = &config.discord_webhook
    {
        Box::new(DiscordNotifier::new(
            url.clone(),
            config.on_success,
            config.on_failure,
        ))
    } else {
        Box::new(LogNotifier)
    }
}

fn print_result(result: &RunResult) {
    let secs = result.total_elapsed.as_secs_f64();
    if result.outcome.is_success() {
        println!("{} backup synced in {secs:.1}s", "✔".green().bold());
    } else {
        println!(
            "{} {} during {} after {secs:.1}s",
            "✘".red().bold(),
            result.outcome.to_string().red(),
            result.stage_reached
        );
        if let Some(detail) = &result.detail {
            println!("  {}", detail.dimmed());
        }
    }
    if let SleepSignal::Failed(e) = &result.sleep_signal {
        println!("{} NAS shutdown failed: {e}", "!".yellow().bold());
    }
}

fn print_config_summary(config: &Config) {
    let t = &config.target;
    let s = &config.sync;
    println!("{} {}", "config".bold(), config.path.display());
    println!("  NAS:          {} ({})", t.ip, t.mac);
    println!(
        "  SSH:          {}:{} key={}",
        t.credential.login(&t.ip),
        t.credential.port,
        t.credential
            .key_path
            .as_ref()
            .map_or_else(|| "default".to_string(), |p| p.display().to_string())
    );
    println!(
        "  Wake:         {}:{}, ping every {}s for up to {}s",
        t.broadcast,
        t.wol_port,
        t.poll_interval.as_secs(),
        t.max_wait.as_secs()
    );
    println!(
        "  Ready:        settle {}s, ssh every {}s for up to {}s",
        t.settle_delay.as_secs(),
        t.ready_poll_interval.as_secs(),
        t.ready_max_wait.as_secs()
    );
    println!(
        "  Sync:         {} {} -> {}",
        s.tool,
        s.raw_options,
        s.destination
    );
    println!("  Source:       {}", s.source.display());
    println!("  Shutdown:     {}", t.shutdown_after_sync);
    println!(
        "  Notification: {}",
        if config.notification.enabled {
            "discord"
        } else {
            "log only"
        }
    );
}

fn long_version() -> &'static str {
    static LONG_VERSION: OnceLock<String> = OnceLock::new();
    LONG_VERSION.get_or_init(|| {
        format!(
            "{}\nbuild timestamp: {}\ntarget: {}",
            env!("CARGO_PKG_VERSION"),
            option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
            option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown"),
        )
    })
}
