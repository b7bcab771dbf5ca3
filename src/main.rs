//! Demo firmware glue: wires the agent to a host platform and runs the
//! cooperative pump loop. Mirrors what a device's `setup()`/`loop()` pair
//! would do.

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::eyre::{eyre, Context, Result};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use firmlink::{
    AgentConfig, CredentialSet, DeviceAgent, NullOutputDriver, OutputKind, PushPolicy,
    RumqttcTransport, TelemetryBatch, VirtualChannel,
};

/// Pump period; must stay finer than the 30 s transport keep-alive.
const TICK: Duration = Duration::from_millis(100);
/// Simulated sensor reporting period, in ticks.
const SENSOR_TICKS: u32 = 300;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    setup()?;

    let config_path = config_path()?;
    info!("Loading configuration from {}", config_path.display());
    let config = AgentConfig::load(&config_path).map_err(|e| eyre!("{e}"))?;

    let credentials = load_credentials(&config_path)?;

    let mut agent = DeviceAgent::new(
        config,
        credentials,
        RumqttcTransport::new(),
        Box::new(NullOutputDriver),
    )
    .map_err(|e| eyre!("{e}"))?;

    agent.on_state("pm", |event| {
        info!(
            "payment success: reference={} amount={} session={}",
            event.reference_id, event.amount, event.active_session_id
        );
    });
    agent.on_state("pp", |event| {
        info!("payment pending: reference={}", event.reference_id);
    });
    agent.on_command("ds", |event| {
        info!("device status command: {}", event.event_name);
    });

    // Channel 1: cloud-controlled lamp on GPIO 17.
    agent.register_channel(VirtualChannel::new(1).with_output(17, OutputKind::Binary));
    // Channel 2: temperature readings, throttled to one report per change
    // per 30 s and at least half a degree of movement.
    agent.register_channel(VirtualChannel::new(2).with_policy(PushPolicy {
        on_change: true,
        min_interval_ms: 30_000,
        min_delta: 0.5,
    }));

    agent.begin().await.map_err(|e| eyre!("{e}"))?;
    info!("session established, entering pump loop");

    let mut batch = TelemetryBatch::new();
    let mut tick: u32 = 0;
    loop {
        agent.pump().await;

        tick = tick.wrapping_add(1);
        if tick % SENSOR_TICKS == 0 {
            let reading = read_temperature();
            agent.push_channel(2, reading).await;

            batch.add("t", reading).add("uptime_s", f64::from(tick) * 0.1);
            if !agent.send_batch(&mut batch).await {
                warn!("batch telemetry deferred, broker unreachable");
            }
        }

        tokio::time::sleep(TICK).await;
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
    Ok(())
}

fn config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::args().nth(1) {
        return Ok(PathBuf::from(path));
    }
    let base = dirs::config_dir().ok_or_else(|| eyre!("no config directory on this host"))?;
    Ok(base.join("firmlink").join("agent.toml"))
}

/// Reads PEM material from files next to the configuration.
fn load_credentials(config_path: &PathBuf) -> Result<CredentialSet> {
    let dir = config_path
        .parent()
        .ok_or_else(|| eyre!("configuration path has no parent directory"))?;
    let ca = std::fs::read_to_string(dir.join("ca.pem"))
        .wrap_err("reading trust anchor ca.pem")?;

    let mut credentials = CredentialSet::with_trust_anchor(ca);
    let cert = dir.join("client.pem");
    let key = dir.join("client.key");
    if cert.exists() && key.exists() {
        credentials = credentials.client_auth(
            std::fs::read_to_string(&cert).wrap_err("reading client certificate")?,
            std::fs::read_to_string(&key).wrap_err("reading client key")?,
        );
    }
    Ok(credentials)
}

/// Stand-in for a real sensor on the demo host.
fn read_temperature() -> f64 {
    21.5
}
