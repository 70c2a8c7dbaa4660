use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use beat_sync_core::{
    list_input_devices, AppConfig, BeatSession, ConsoleSpinner, CpalDriver, OscRoutes,
    SharedControls,
};
use clap::Parser;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "beat-sync stopped");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> beat_sync_core::Result<()> {
    if cli.list_devices {
        for (index, name) in list_input_devices()? {
            println!("{index}: {name}");
        }
        return Ok(());
    }

    let config = cli.resolve_config()?;
    tracing::info!(?config, "starting beat detection");

    let display = Arc::new(ConsoleSpinner::new());
    let mut session = BeatSession::start(&config, &CpalDriver::new(), display)?;

    println!("Listening. Commands: r = resync, s = toggle sync, d <n> = divider, q = quit.");
    println!("Press Ctrl+C to stop.");

    let (quit_tx, quit_rx) = oneshot::channel();
    spawn_command_reader(session.controls().clone(), session.routes().clone(), quit_tx);
    wait_for_shutdown(quit_rx)?;

    println!("Stopping...");
    session.shutdown();
    Ok(())
}

fn wait_for_shutdown(quit_rx: oneshot::Receiver<()>) -> beat_sync_core::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "failed to listen for Ctrl+C");
                }
            }
            // a closed stdin drops the sender; only an explicit quit ends the session
            Ok(()) = quit_rx => {}
        }
    });
    Ok(())
}

/// Reads operator commands from stdin on its own thread, playing the role of
/// the UI that mutates the shared controls while audio is running.
fn spawn_command_reader(controls: SharedControls, routes: OscRoutes, quit_tx: oneshot::Sender<()>) {
    let spawned = std::thread::Builder::new()
        .name("console-commands".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match parse_command(&line) {
                    Some(Command::Quit) => {
                        let _ = quit_tx.send(());
                        return;
                    }
                    Some(command) => apply_command(command, &controls, &routes),
                    None if line.trim().is_empty() => {}
                    None => println!("unknown command `{}`", line.trim()),
                }
            }
        });

    if let Err(err) = spawned {
        tracing::warn!(error = %err, "console commands unavailable");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Resync,
    ToggleSync,
    Divider(u32),
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let command = match parts.next()? {
        "r" | "resync" => Command::Resync,
        "s" | "sync" => Command::ToggleSync,
        "q" | "quit" => Command::Quit,
        "d" | "divider" => Command::Divider(parts.next()?.parse().ok()?),
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(command)
}

fn apply_command(command: Command, controls: &SharedControls, routes: &OscRoutes) {
    match command {
        Command::Resync => {
            let outcome = routes.resync();
            println!("resync: {outcome:?}");
        }
        Command::ToggleSync => {
            let enabled = controls.toggle_sync();
            println!("sync {}", if enabled { "on" } else { "off" });
        }
        Command::Divider(divider) => match controls.set_beat_divider(divider) {
            Ok(()) => println!("beat divider {divider}"),
            Err(err) => println!("{err}"),
        },
        Command::Quit => {}
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live beat detection with OSC tempo sync", long_about = None)]
struct Cli {
    /// JSON configuration file. Command line flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Input device index, as printed by --list-devices.
    #[arg(short, long)]
    device: Option<usize>,
    /// Samples per analysed buffer.
    #[arg(short, long)]
    buffer_size: Option<usize>,
    /// OSC destination host.
    #[arg(long)]
    host: Option<String>,
    /// OSC destination port.
    #[arg(short, long)]
    port: Option<u16>,
    /// Forward detected tempo to the OSC controller from the start.
    #[arg(short, long)]
    sync: bool,
    /// Forward one onset out of every N, with the tempo divided by N.
    #[arg(long)]
    divider: Option<u32>,
    /// Print the available input devices and exit.
    #[arg(long)]
    list_devices: bool,
}

impl Cli {
    fn resolve_config(&self) -> beat_sync_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::live_defaults(),
        };

        if let Some(device) = self.device {
            config.audio.device_index = Some(device);
        }
        if let Some(buffer_size) = self.buffer_size {
            config.audio.buffer_size = buffer_size;
        }
        if let Some(host) = &self.host {
            config.osc.host = host.clone();
        }
        if let Some(port) = self.port {
            config.osc.port = port;
        }
        if self.sync {
            config.sync.enabled = true;
        }
        if let Some(divider) = self.divider {
            config.sync.beat_divider = divider;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "beat-sync",
            "--device",
            "2",
            "--buffer-size",
            "256",
            "--port",
            "9000",
            "--sync",
            "--divider",
            "4",
        ])
        .unwrap();

        let config = cli.resolve_config().unwrap();
        assert_eq!(config.audio.device_index, Some(2));
        assert_eq!(config.audio.buffer_size, 256);
        assert_eq!(config.osc.port, 9000);
        assert_eq!(config.osc.host, "127.0.0.1");
        assert!(config.sync.enabled);
        assert_eq!(config.sync.beat_divider, 4);
    }

    #[test]
    fn zero_divider_is_rejected() {
        let cli = Cli::try_parse_from(["beat-sync", "--divider", "0"]).unwrap();
        assert!(cli.resolve_config().is_err());
    }

    #[test]
    fn parses_console_commands() {
        assert_eq!(parse_command("r"), Some(Command::Resync));
        assert_eq!(parse_command(" sync "), Some(Command::ToggleSync));
        assert_eq!(parse_command("d 4"), Some(Command::Divider(4)));
        assert_eq!(parse_command("q"), Some(Command::Quit));
        assert_eq!(parse_command("d"), None);
        assert_eq!(parse_command("d four"), None);
        assert_eq!(parse_command("r now"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn divider_command_updates_controls() {
        let controls = SharedControls::new(true, 1).unwrap();
        let sender = std::sync::Arc::new(beat_sync_core::OscSender::new("127.0.0.1", 9).unwrap());
        let routes = OscRoutes::new(sender, &AppConfig::default().osc);

        apply_command(Command::Divider(3), &controls, &routes);
        apply_command(Command::ToggleSync, &controls, &routes);
        apply_command(Command::Divider(0), &controls, &routes);

        let state = controls.snapshot();
        assert_eq!(state.beat_divider, 3);
        assert!(!state.sync_enabled);
    }
}
