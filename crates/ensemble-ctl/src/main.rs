//! ensemble-ctl — controller command-line interface for Ensemble devices.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use ensemble_core::config::EnsembleConfig;
use ensemble_core::crypto::CodeKey;
use ensemble_core::message::{Arg, Message};

use ensemble_services::broadcast::{BroadcastChannel, Inbound};
use ensemble_services::link::{DeviceLink, LinkFailure, LinkPorts, NetTransport};
use ensemble_services::{netif, ClockSynchronizer, PeerRecord, PeerRegistry};

const DEFAULT_WAIT_SECS: u64 = 3;

// ── Discovery ─────────────────────────────────────────────────────────────────

struct Controller {
    config: EnsembleConfig,
    registry: PeerRegistry,
    interface: Option<Ipv4Addr>,
    group: Ipv4Addr,
    channels: Vec<Arc<BroadcastChannel>>,
}

impl Controller {
    fn new(config: EnsembleConfig, interface: &str) -> Result<Self> {
        let selection = netif::resolve(interface);
        let group = config
            .network
            .multicast_addr
            .parse()
            .with_context(|| format!("invalid multicast address {}", config.network.multicast_addr))?;
        let registry = PeerRegistry::new(
            Arc::new(NetTransport::from_config(&config.link)),
            LinkPorts {
                control: config.network.control_port,
                code: config.network.code_port,
            },
            config.link.clone(),
        );
        Ok(Self {
            config,
            registry,
            interface: selection.addr(),
            group,
            channels: Vec::new(),
        })
    }

    /// Join the alive and status groups and feed both into the registry.
    fn listen(&mut self) -> Result<()> {
        for (port, what) in [
            (self.config.network.broadcast_port, "broadcast"),
            (self.config.network.status_port, "status"),
        ] {
            let channel = BroadcastChannel::join(self.group, port, self.interface)
                .with_context(|| format!("failed to join {what} group"))?;
            let registry = self.registry.clone();
            channel.subscribe(move |inbound: &Inbound| registry.handle_datagram(&inbound.datagram));
            self.channels.push(channel);
        }
        Ok(())
    }

    async fn discover(&mut self, wait: Duration) -> Result<()> {
        self.listen()?;
        tokio::time::sleep(wait).await;
        Ok(())
    }

    /// The discovered link for `host`, or a direct link treating `host` as
    /// its own address.
    fn link(&self, host: &str) -> Arc<DeviceLink> {
        if let Some(link) = self.registry.get(host) {
            return link;
        }
        tracing::info!(host, "host not discovered, addressing it directly");
        Arc::new(DeviceLink::new(
            Arc::new(Mutex::new(PeerRecord::new(host, host, ""))),
            Arc::new(NetTransport::from_config(&self.config.link)),
            LinkPorts {
                control: self.config.network.control_port,
                code: self.config.network.code_port,
            },
            &self.config.link,
        ))
    }

    fn close(&self) {
        for channel in &self.channels {
            channel.dispose();
        }
    }
}

fn report_failures(link: &DeviceLink) {
    link.add_error_listener(|kind: LinkFailure, message: &str| {
        eprintln!("  ! {kind:?}: {message}");
    });
}

/// Integers, then floats, then strings.
fn parse_arg(raw: &str) -> Arg {
    if let Ok(i) = raw.parse::<i64>() {
        Arg::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Arg::Float(f)
    } else {
        Arg::from(raw)
    }
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_peers(mut ctl: Controller, wait: Duration) -> Result<()> {
    ctl.discover(wait).await?;
    let links = ctl.registry.links();
    ctl.close();

    if links.is_empty() {
        println!("No devices discovered.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Discovered Devices ({})", links.len());
    println!("═══════════════════════════════════════");

    for link in &links {
        let r = link.record().lock().clone();
        let id = if r.id < 0 { "-".to_string() } else { r.id.to_string() };
        println!("  ┌─ {}", r.hostname);
        println!("  │  device    : {}", r.device_name);
        println!("  │  address   : {}", r.address);
        println!("  │  id        : {}", id);
        println!("  │  status    : {}", r.status);
        println!("  │  locators  : {}", r.locators.iter().collect::<Vec<_>>().join(", "));
        println!("  └─ last seen : {:.1}s ago", r.last_seen.elapsed().as_secs_f64());
        for line in r.log.lines() {
            println!("       log: {}", line);
        }
    }

    Ok(())
}

async fn cmd_send(mut ctl: Controller, wait: Duration, host: &str, name: &str, raw_args: &[&str]) -> Result<()> {
    anyhow::ensure!(name.starts_with('/'), "message name must start with '/'");
    ctl.discover(wait).await?;
    let link = ctl.link(host);
    report_failures(&link);

    let message = Message::new(name, raw_args.iter().map(|a| parse_arg(a)).collect());
    let result = link.send(&message);
    ctl.close();
    result.with_context(|| format!("failed to send {name} to {host}"))?;
    println!("Sent {} to {}.", name, host);
    Ok(())
}

async fn cmd_assign(mut ctl: Controller, wait: Duration, host: &str, id: i64) -> Result<()> {
    ctl.discover(wait).await?;
    let assigned = ctl.registry.assign_id(host, id);
    ctl.close();
    anyhow::ensure!(assigned, "{host} was not discovered");
    println!("Assigned id {} to {}.", id, host);
    Ok(())
}

async fn cmd_push(mut ctl: Controller, wait: Duration, host: &str, path: &str) -> Result<()> {
    let unit = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
    serde_json::from_slice::<serde_json::Value>(&unit)
        .with_context(|| format!("{path} is not valid JSON"))?;

    ctl.discover(wait).await?;
    let link = ctl.link(host);
    report_failures(&link);

    let key = CodeKey::from_passphrase(&ctl.config.code.encryption_key);
    let result = tokio::task::spawn_blocking(move || link.push_code(&key, &unit)).await?;
    ctl.close();
    result.with_context(|| format!("failed to push {path} to {host}"))?;
    println!("Pushed {} to {}.", path, host);
    Ok(())
}

async fn cmd_time(ctl: Controller, secs: u64) -> Result<()> {
    let channel = BroadcastChannel::join(ctl.group, ctl.config.network.clock_sync_port, ctl.interface)
        .context("failed to join clock sync group")?;
    let clock = ClockSynchronizer::start(&ctl.config.clock, channel.clone());

    println!("═══════════════════════════════════════");
    println!("  Clock Synchronization ({}s)", secs);
    println!("═══════════════════════════════════════");

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    for _ in 0..secs {
        interval.tick().await;
        println!(
            "  {:?} stability {:.2} offset {:+.1} ms corrected {}",
            clock.state(),
            clock.stability(),
            clock.offset_ms(),
            clock.corrected_time_now()
        );
    }

    clock.shutdown();
    channel.dispose();
    Ok(())
}

fn print_usage() {
    println!("Usage: ensemble-ctl [--interface <name>] [--wait <secs>] <command>");
    println!();
    println!("Commands:");
    println!("  peers                        List devices announcing themselves");
    println!("  send <host> <message> [args] Send a control message to a device");
    println!("  assign <host> <id>           Assign a device id");
    println!("  push <host> <unit.json>      Seal and push a code unit");
    println!("  time [secs]                  Watch clock synchronization");
    println!();
    println!("Options:");
    println!("  --interface <name>   Network interface (default: from config)");
    println!("  --wait <secs>        Discovery time before acting (default: {})", DEFAULT_WAIT_SECS);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = EnsembleConfig::load().context("failed to load config")?;

    let mut interface = config.network.interface.clone();
    let mut wait = Duration::from_secs(DEFAULT_WAIT_SECS);
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--interface" => {
                i += 1;
                interface = args.get(i).context("--interface requires a value")?.clone();
            }
            "--wait" => {
                i += 1;
                let secs: u64 = args
                    .get(i)
                    .context("--wait requires a value")?
                    .parse()
                    .context("--wait must be a number")?;
                wait = Duration::from_secs(secs);
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    let ctl = Controller::new(config, &interface)?;

    match remaining.as_slice() {
        ["peers"] | []                      => cmd_peers(ctl, wait).await,
        ["send", host, name, rest @ ..]     => cmd_send(ctl, wait, host, name, rest).await,
        ["assign", host, id]                => {
            let id: i64 = id.parse().context("id must be an integer")?;
            cmd_assign(ctl, wait, host, id).await
        }
        ["push", host, path]                => cmd_push(ctl, wait, host, path).await,
        ["time"]                            => cmd_time(ctl, 10).await,
        ["time", secs]                      => cmd_time(ctl, secs.parse().context("secs must be a number")?).await,
        ["help"] | ["--help"] | ["-h"]      => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
