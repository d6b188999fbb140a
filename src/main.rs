use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;

use ups_snmp_agent::config::Config;
use ups_snmp_agent::device;
use ups_snmp_agent::mib::Mib;
use ups_snmp_agent::model::UpsState;
use ups_snmp_agent::snmp::agent::{bind_udp, Agent, AgentConfig, Engine};
use ups_snmp_agent::snmp::trap::{TrapDestination, TrapSender};
use ups_snmp_agent::{logging, poll, serial};

#[derive(Parser, Debug)]
#[command(version, about = "UPS-MIB SNMP agent for Megatec/Voltronic Q1 serial UPS hardware")]
struct Args {
    /// Configuration file; written out with defaults when missing.
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load_or_create(&args.config)?;
    let _log_guard = logging::init(
        &config.log_level,
        &config.snmp.log_level,
        config.filter_words(),
    )?;

    tracing::info!(
        config = %args.config.display(),
        port = %config.com_port,
        listen = %format!("{}:{}", config.address, config.port),
        "ups-snmp-agent v{} starting",
        env!("CARGO_PKG_VERSION"),
    );

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // Everything in this block is fatal-at-start: a failure logs, aborts
    // and exits 1 before any task is spawned.
    let mib = Arc::new(Mib::load_dir("mibs").context("failed to load MIB modules from mibs/")?);

    let profile = device::mt1000_pro();
    let collapsed = config.snmp.public == config.snmp.private;

    let port = serial::open(&config.com_port)
        .with_context(|| format!("failed to open serial port '{}'", config.com_port))?;
    let (serial_read, serial_write) = tokio::io::split(port);

    let (cmd_tx, cmd_rx) = unbounded_channel();
    let (line_tx, mut line_rx) = unbounded_channel();

    let state = {
        let mut state = UpsState::new(profile, collapsed, config.disable_buzz, cmd_tx.clone());
        state
            .register_scalars(&mib, &(profile.enable_mask)())
            .context("scalar binding registration failed")?;
        (profile.init)(&mut state, &mib).context("profile initialisation failed")?;
        Arc::new(Mutex::new(state))
    };

    let engine = Arc::new(Engine::new());

    let listen = config.listen_addr()?;
    let socket = bind_udp(listen)
        .await
        .with_context(|| format!("failed to bind UDP {}", listen))?;

    let users = config.usm_users()?;
    if !users.is_empty() {
        tracing::info!(target: "snmp::agent", users = users.len(),
            "SNMPv3 users configured, agent is v3-only");
    }
    let agent = Arc::new(Agent::new(
        socket,
        state.clone(),
        engine.clone(),
        AgentConfig {
            public_community: config.snmp.public.clone().into_bytes(),
            private_community: config.snmp.private.clone().into_bytes(),
            users,
        },
        cancel.clone(),
    ));
    tracing::info!(target: "snmp::agent", listen = %listen, profile = profile.name,
        "SNMP agent ready");

    // Trap destinations: a connect failure is reported, the agent runs on
    // without that target.
    let traps = {
        let mut traps = TrapSender::new(engine.clone());
        for entry in &config.snmp.trap {
            if !entry.enable {
                continue;
            }
            let user = entry.user.to_usm_user()?;
            match TrapDestination::connect(
                &entry.host,
                entry.port,
                entry.version.into(),
                entry.community.clone().into_bytes(),
                user,
                &engine,
            )
            .await
            {
                Ok(destination) => traps.add_destination(destination),
                Err(e) => tracing::warn!(target: "snmp::trap", host = %entry.host,
                    port = entry.port, error = %e, "trap destination unavailable"),
            }
        }
        Arc::new(traps)
    };

    let writer_task = tokio::spawn(serial::run_writer(serial_write, cmd_rx, cancel.clone()));
    let reader_task = tokio::spawn(serial::run_reader(serial_read, line_tx, cancel.clone()));

    // Receive path: decode under the state lock, dispatch traps after it is
    // released so a manager walking the agent after a trap sees the
    // committed alarm table.
    let receive_task = {
        let state = state.clone();
        let mib = mib.clone();
        let traps = traps.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                let pending = {
                    let mut state = state.lock().expect("state mutex poisoned");
                    let hook = state.profile.on_receive;
                    hook(&mut state, &mib, engine.uptime_ticks(), &line)
                };
                for trap in pending {
                    traps.broadcast(&trap.to_event(&mib)).await;
                }
            }
        })
    };

    let poll_task = tokio::spawn(poll::run(profile.commands, cmd_tx.clone(), cancel.clone()));
    let agent_task = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    shutdown_signal().await?;
    tracing::info!("shutdown signal received, stopping");
    cancel.cancel();
    drop(cmd_tx);

    for (name, task) in [
        ("poll", poll_task),
        ("serial-writer", writer_task),
        ("serial-reader", reader_task),
        ("receive", receive_task),
        ("agent", agent_task),
    ] {
        if let Err(e) = task.await {
            tracing::warn!(task = name, error = %e, "task join failed");
        }
    }

    tracing::info!("ups-snmp-agent stopped");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to await SIGINT")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to await ctrl-c")?;
    }
    Ok(())
}
