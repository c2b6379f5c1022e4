#![forbid(unsafe_code)]

use fleetc::agent::Agent;
use fleetc::config::{load_config, AgentConfig, Cli, Commands};

use clap::Parser;
use fleet_common::identity;
use fleet_common::types::{Job, JobStatus, RobotStatus};
use serde_json::Value;
use std::io::IsTerminal;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

fn resolve_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = load_config(cli.config.as_deref())?;

    if let Some(ref relay) = cli.relay {
        config.relay = relay.clone();
    }
    if let Some(ref owner_key) = cli.owner_key {
        config.owner_key = owner_key.clone();
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

/// Builds an agent from config and waits for the relay connection.
async fn connected_agent(config: &AgentConfig) -> anyhow::Result<Agent> {
    let agent = Agent::from_config(config)?;
    info!(peer_id = %agent.peer_id(), relay = %config.relay, "connecting");
    agent.connect();

    let wait = config.request.timeout();
    if let Err(e) = agent.wait_connected(wait).await {
        if tty() {
            eprintln!();
            eprintln!("  {RED}✗{RESET} Could not connect to relay");
            eprintln!("    {DIM}{} ({e}){RESET}", config.relay);
            eprintln!();
        } else {
            eprintln!("Failed to connect to relay {}: {e}", config.relay);
        }
        std::process::exit(1);
    }
    Ok(agent)
}

// ── Pretty formatters ───────────────────────────────────────────────

fn fmt_status(status: JobStatus) -> String {
    match status {
        JobStatus::Pending => format!("{YELLOW}●{RESET} pending"),
        JobStatus::InProgress => format!("{CYAN}●{RESET} in progress"),
        JobStatus::Completed => format!("{GREEN}●{RESET} completed"),
        JobStatus::Failed => format!("{RED}●{RESET} failed"),
        JobStatus::Unknown => format!("{DIM}●{RESET} unknown"),
    }
}

fn fmt_jobs(jobs: &[Job]) {
    println!();
    if jobs.is_empty() {
        println!("  {DIM}No jobs{RESET}");
        println!();
        return;
    }

    let id_w = jobs.iter().map(|j| j.id.len()).max().unwrap_or(2).max(2);
    let type_w = jobs.iter().map(|j| j.kind.len()).max().unwrap_or(4).max(4);
    println!(
        "  {BOLD}{:<id_w$}{RESET}   {BOLD}{:<type_w$}{RESET}   {BOLD}STATUS{RESET}",
        "ID", "TYPE"
    );
    for job in jobs {
        println!(
            "  {:<id_w$}   {:<type_w$}   {}",
            job.id,
            job.kind,
            fmt_status(job.status)
        );
    }
    println!();
    println!("  {DIM}{} jobs{RESET}", jobs.len());
    println!();
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── Terminal ────────────────────────────────────────────────────────

async fn run_terminal(agent: &Agent, robot: &str, job: &str) -> anyhow::Result<()> {
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("terminal requires an interactive stdin");
    }

    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let from = robot.to_string();
    let sub = agent.subscribe(move |message| {
        if message.get("from").and_then(Value::as_str) != Some(from.as_str()) {
            return Ok(());
        }
        let content = &message["content"];
        if let Some(text) = content
            .get("stdout")
            .or_else(|| content.get("stderr"))
            .and_then(Value::as_str)
        {
            let _ = out_tx.send(text.to_string());
        }
        Ok(())
    });

    agent.start_terminal_session(robot, job).await?;
    if tty() {
        eprintln!("  {DIM}Attached to {job} on {robot}. Ctrl-D to detach.{RESET}");
    }

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                if let Err(e) = agent.send_terminal_command(&format!("{line}\n")).await {
                    warn!(error = %e, "terminal input not delivered");
                }
            }
            Some(text) = out_rx.recv() => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    agent.unsubscribe(sub);
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Failed to install rustls crypto provider - may already be installed or unsupported platform");
    }

    let cli = Cli::parse();

    init_tracing(&cli)?;

    match &cli.command {
        Commands::Keygen => {
            let key = identity::generate_keypair();
            let peer_id = identity::peer_id(&key.verifying_key().to_bytes());
            let secret = identity::secret_to_base64(&key);
            if tty() {
                println!();
                println!("  {DIM}PeerId{RESET}       {CYAN}{peer_id}{RESET}");
                println!("  {DIM}Secret key{RESET}   {secret}");
                println!();
                println!("  {DIM}Set secret_key in config.toml or FLEETC_SECRET_KEY.{RESET}");
                println!();
            } else {
                print_json(&serde_json::json!({"peer_id": peer_id, "secret_key": secret}))?;
            }
        }

        Commands::Identity => {
            let config = load_config(cli.config.as_deref())?;
            let key = identity::keypair_from_secret(&config.secret_key)?;
            println!("{}", identity::peer_id(&key.verifying_key().to_bytes()));
        }

        Commands::Robots => {
            let config = resolve_config(&cli)?;
            let agent = connected_agent(&config).await?;
            let robots = agent.get_robots().await;
            if tty() {
                println!();
                if robots.is_empty() {
                    println!("  {DIM}No robots{RESET}");
                }
                for robot in &robots {
                    let dot = match robot.status {
                        Some(RobotStatus::Online) => format!("{GREEN}●{RESET}"),
                        _ => format!("{DIM}●{RESET}"),
                    };
                    println!(
                        "  {dot} {BOLD}{}{RESET}   {CYAN}{}{RESET}",
                        robot.name, robot.robot_peer_id
                    );
                }
                println!();
            } else {
                print_json(&robots)?;
            }
            agent.disconnect().await;
        }

        Commands::Network => {
            let config = resolve_config(&cli)?;
            let agent = connected_agent(&config).await?;
            print_json(&agent.get_network_info().await)?;
            agent.disconnect().await;
        }

        Commands::Jobs { robot } => {
            let config = resolve_config(&cli)?;
            let agent = connected_agent(&config).await?;
            let jobs = agent.get_jobs(robot).await;
            agent.disconnect().await;
            let jobs = jobs?;
            if tty() {
                fmt_jobs(&jobs);
            } else {
                print_json(&jobs)?;
            }
        }

        Commands::JobInfo { robot, job } => {
            let config = resolve_config(&cli)?;
            let agent = connected_agent(&config).await?;
            let info = agent.get_job_info(robot, job).await;
            agent.disconnect().await;
            print_json(&info?)?;
        }

        Commands::StartJob {
            robot,
            job_type,
            args,
        } => {
            let args: Value = serde_json::from_str(args)
                .map_err(|e| anyhow::anyhow!("--args must be a JSON document: {e}"))?;
            let config = resolve_config(&cli)?;
            let agent = connected_agent(&config).await?;
            let job = agent.launch_job(robot, job_type, &args).await;
            agent.disconnect().await;
            let job = job?;
            if tty() {
                println!(
                    "  {GREEN}✓{RESET} Started {BOLD}{}{RESET} {DIM}({}){RESET}",
                    job.kind, job.id
                );
            } else {
                print_json(&job)?;
            }
        }

        Commands::Terminal { robot, job } => {
            let config = resolve_config(&cli)?;
            let agent = connected_agent(&config).await?;
            let result = run_terminal(&agent, robot, job).await;
            agent.disconnect().await;
            result?;
        }
    }

    Ok(())
}
