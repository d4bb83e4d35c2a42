use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{Command, DaemonEvent, MonitorSnapshot, Response, SessionStatus};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;

#[derive(Parser)]
#[command(name = "moniquectl")]
#[command(about = "Monitor profile daemon control", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status and any pending apply session
    Status,

    /// List connected monitors as the compositor reports them
    Outputs,

    /// List stored profiles
    Profiles,

    /// Apply a stored profile; it reverts unless confirmed in time
    Apply {
        /// Profile name
        name: String,
    },

    /// Delete a stored profile
    Delete {
        /// Profile name
        name: String,
    },

    /// Keep the layout that is waiting for confirmation
    Confirm,

    /// Roll back the layout that is waiting for confirmation
    Revert,

    /// Ping the daemon to check if it's running
    Ping,

    /// Print daemon events as they happen
    Watch,

    /// Kill the running daemon
    Kill,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Status => Command::Status,
        Commands::Outputs => Command::ListOutputs,
        Commands::Profiles => Command::ListProfiles,
        Commands::Apply { name } => Command::ApplyProfile { name },
        Commands::Delete { name } => Command::DeleteProfile { name },
        Commands::Confirm => Command::Confirm,
        Commands::Revert => Command::Revert,
        Commands::Ping => Command::Ping,
        Commands::Watch => Command::Watch,
        Commands::Kill => Command::Kill,
    };
    let watching = matches!(command, Command::Watch);

    let mut reader = match send_command(&command).await {
        Ok(reader) => reader,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            eprintln!("\nIs the daemon running? Try starting it with: moniqued");
            std::process::exit(1);
        }
    };

    loop {
        match read_response(&mut reader).await? {
            Some(response) => handle_response(response),
            None if watching => {
                eprintln!("Daemon closed the connection");
                std::process::exit(1);
            }
            None => anyhow::bail!("daemon closed the connection without answering"),
        }
        if !watching {
            return Ok(());
        }
    }
}

async fn send_command(command: &Command) -> Result<BufReader<OwnedReadHalf>> {
    let socket_path = common::get_socket_path();

    let stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("connecting to {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();

    let command_json = serde_json::to_string(command)?;
    writer.write_all(command_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    // Writer half dropped here; the daemon keeps reading until EOF
    Ok(BufReader::new(reader))
}

async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<Response>> {
    let mut response_line = String::new();
    if reader.read_line(&mut response_line).await? == 0 {
        return Ok(None);
    }
    let response: Response = serde_json::from_str(&response_line)?;
    Ok(Some(response))
}

fn handle_response(response: Response) {
    match response {
        Response::Ok => {
            println!("✓ Success");
        }
        Response::Error(e) => {
            eprintln!("✗ Error: {}", e);
            std::process::exit(1);
        }
        Response::Pong => {
            println!("✓ Daemon is running");
        }
        Response::Status(status) => {
            println!("Daemon Status:");
            println!("  Version: {}", status.version);
            println!("  Uptime: {}s", status.uptime_secs);
            println!(
                "  Compositor: {}",
                status.backend.as_deref().unwrap_or("none detected")
            );
            println!(
                "  Active profile: {}",
                status.active_profile.as_deref().unwrap_or("-")
            );
            match status.session {
                Some(session) => println!(
                    "  Pending: {} ({})",
                    session.profile,
                    describe(&session.status)
                ),
                None => println!("  Pending: -"),
            }
        }
        Response::Outputs(snapshot) => print_outputs(&snapshot),
        Response::Profiles(profiles) => {
            if profiles.is_empty() {
                println!("No profiles stored");
            }
            for profile in profiles {
                let applied = profile
                    .last_applied
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  {} [{}] (last applied: {})",
                    profile.name,
                    profile.monitors.join(", "),
                    applied
                );
            }
        }
        Response::Event(event) => print_event(&event),
    }
}

fn print_outputs(snapshot: &MonitorSnapshot) {
    println!("Connected Outputs:");
    for m in snapshot.monitors() {
        if !m.enabled {
            println!("  {} - disabled", m.name);
            continue;
        }
        println!(
            "  {} - {}x{}@{:.3}Hz at {},{} (scale: {}, transform: {:?}){}",
            m.name,
            m.mode.width,
            m.mode.height,
            m.mode.refresh_hz(),
            m.x,
            m.y,
            m.scale,
            m.transform,
            if m.identity.is_empty() {
                String::new()
            } else {
                format!(" [{}]", m.identity)
            }
        );
    }
}

fn print_event(event: &DaemonEvent) {
    match event {
        DaemonEvent::Session { profile, status } => {
            println!("session {}: {}", profile, describe(status));
        }
        DaemonEvent::Reverted { profile } => println!("reverted {}", profile),
        DaemonEvent::Snapshot(snapshot) => {
            let names: Vec<String> = snapshot
                .enabled()
                .map(|m| format!("{}@{},{}", m.name, m.x, m.y))
                .collect();
            println!("outputs {}", names.join(" "));
        }
        DaemonEvent::NoMatch => println!("no profile matches the connected monitors"),
        DaemonEvent::Clamshell { output, enabled } => println!(
            "clamshell {} {}",
            if *enabled { "enabled" } else { "disabled" },
            output
        ),
    }
}

fn describe(status: &SessionStatus) -> String {
    match status {
        SessionStatus::Applying => "applying".to_string(),
        SessionStatus::Confirming { remaining_ms } => {
            format!("confirm within {:.1}s", *remaining_ms as f64 / 1000.0)
        }
        SessionStatus::Confirmed => "confirmed".to_string(),
        SessionStatus::Reverting => "reverting".to_string(),
        SessionStatus::Failed { reason } => format!("failed: {}", reason),
    }
}
