//! ---
//! ivsim_section: "01-core-functionality"
//! ivsim_subsection: "binary"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Binary entrypoint for the IV device simulator."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use ivsim_common::logging::init_tracing;
use ivsim_common::{AppConfig, TransportKind};
use ivsim_msg::{ConnectionProvider, InMemoryTransport, LoopbackProvider};
use ivsim_net::DpsConnectionProvider;
use ivsim_sim::{RunOutcome, SimulationEngine};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "configs/ivsim.toml";

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Simulated IV2Go infusion device",
    long_about = None
)]
struct Cli {
    #[arg(short = 'd', long, env = "DEVICE_ID", help = "Device identity to register as")]
    device_id: Option<String>,

    #[arg(
        short = 'k',
        long,
        env = "DEVICE_KEY",
        hide_env_values = true,
        help = "Device symmetric key (base64); derived from the group key when absent"
    )]
    device_key: Option<String>,

    #[arg(short = 's', long, env = "DEVICE_ID_SCOPE", help = "Provisioning ID scope")]
    id_scope: Option<String>,

    #[arg(short = 'm', long, env = "DEVICE_MODEL_ID", help = "Device model identifier")]
    model_id: Option<String>,

    #[arg(
        long,
        env = "DEVICE_GROUP_KEY",
        hide_env_values = true,
        help = "Enrollment group key (base64) used to derive the device key"
    )]
    group_key: Option<String>,

    #[arg(short = 'i', long, value_name = "SECONDS", help = "Telemetry interval")]
    interval: Option<u64>,

    #[arg(long, value_name = "ML", help = "Infusion bag size")]
    bag_size: Option<f64>,

    #[arg(long, value_name = "ML_PER_HOUR", help = "Infusion flow rate")]
    flowrate: Option<f64>,

    #[arg(long, value_enum, help = "Backend to connect to")]
    transport: Option<CliTransport>,

    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(short = 'q', long, help = "Only print warnings and errors")]
    quiet: bool,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTransport {
    Mqtt,
    Https,
    Loopback,
}

impl From<CliTransport> for TransportKind {
    fn from(value: CliTransport) -> Self {
        match value {
            CliTransport::Mqtt => TransportKind::Mqtt,
            CliTransport::Https => TransportKind::Https,
            CliTransport::Loopback => TransportKind::Loopback,
        }
    }
}

fn version_line() -> String {
    format!(
        "ivsimd {} ({})",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown")
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("{}", version_line());
        return Ok(());
    }

    let (mut config, config_path) = load_config(&cli)?;
    apply_overrides(&cli, &mut config);
    init_tracing("ivsimd", &config.logging)?;
    info!(
        version = %version_line(),
        config_path = %config_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<defaults>".to_owned()),
        transport = ?config.transport.kind,
        "configuration loaded"
    );
    config.validate().context("invalid configuration")?;

    let provider = build_provider(&config)?;
    let engine = SimulationEngine::new(config.simulation.clone(), provider)?;
    let snapshot = engine.model().snapshot();
    info!(
        battery = snapshot.battery_level,
        bag_ml = snapshot.liquid_left_in_bag,
        flowrate = snapshot.flowrate,
        time_left = snapshot.time_left_of_treatment,
        "starting simulation"
    );

    let summary = engine.run_until(shutdown_signal()).await?;
    match summary.outcome {
        RunOutcome::Completed => info!(ticks = summary.ticks, "treatment complete, exiting"),
        RunOutcome::Shutdown => info!(ticks = summary.ticks, "stopped by signal"),
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<(AppConfig, Option<PathBuf>)> {
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        if !path.exists() {
            bail!("configuration file {} does not exist", path.display());
        }
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));
    let loaded = AppConfig::load_with_source(&candidates)?;
    Ok((loaded.config, loaded.source))
}

fn apply_overrides(cli: &Cli, config: &mut AppConfig) {
    if let Some(device_id) = &cli.device_id {
        config.device.device_id = device_id.clone();
    }
    if let Some(device_key) = &cli.device_key {
        config.device.device_key = Some(device_key.clone());
    }
    if let Some(id_scope) = &cli.id_scope {
        config.device.id_scope = Some(id_scope.clone());
    }
    if let Some(model_id) = &cli.model_id {
        config.device.model_id = model_id.clone();
    }
    if let Some(group_key) = &cli.group_key {
        config.device.group_key = Some(group_key.clone());
    }
    if let Some(seconds) = cli.interval {
        config.simulation.tick_interval = Duration::from_secs(seconds);
    }
    if let Some(bag_size) = cli.bag_size {
        config.simulation.bag_size_ml = bag_size;
    }
    if let Some(flowrate) = cli.flowrate {
        config.simulation.flowrate_ml_per_hour = flowrate;
    }
    if let Some(transport) = cli.transport {
        config.transport.kind = transport.into();
    }
    if cli.quiet {
        config.logging.quiet = true;
    }
}

fn build_provider(config: &AppConfig) -> Result<Arc<dyn ConnectionProvider>> {
    match config.transport.kind {
        TransportKind::Mqtt | TransportKind::Https => {
            let provider = DpsConnectionProvider::from_config(config)
                .context("unable to prepare device provisioning")?;
            Ok(Arc::new(provider))
        }
        TransportKind::Loopback => {
            warn!("loopback transport selected, telemetry stays in-process");
            Ok(Arc::new(LoopbackProvider::new(
                config.device.device_id.clone(),
                InMemoryTransport::new(),
            )))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "unable to listen for ctrl-c");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "unable to listen for SIGTERM");
                future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ivsimd").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn cli_flags_override_file_values() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[device]\ndevice_id = \"from-file\"\nid_scope = \"0ne-file\"\n\n[simulation]\ntick_interval = 5\nbag_size_ml = 500.0"
        )
        .expect("write config");
        let path = file.path().to_string_lossy().to_string();
        let cli = parse(&[
            "--config",
            &path,
            "-d",
            "iv-pump-09",
            "-i",
            "2",
            "--flowrate",
            "90",
            "--transport",
            "loopback",
            "-q",
        ]);

        let (mut config, source) = load_config(&cli).expect("load");
        assert_eq!(source.as_deref(), Some(file.path()));
        apply_overrides(&cli, &mut config);

        assert_eq!(config.device.device_id, "iv-pump-09");
        assert_eq!(config.device.id_scope.as_deref(), Some("0ne-file"));
        assert_eq!(config.simulation.tick_interval, Duration::from_secs(2));
        assert_eq!(config.simulation.bag_size_ml, 500.0);
        assert_eq!(config.simulation.flowrate_ml_per_hour, 90.0);
        assert_eq!(config.transport.kind, TransportKind::Loopback);
        assert!(config.logging.quiet);
        config.validate().expect("loopback config is valid");
    }

    #[test]
    fn missing_explicit_config_file_is_an_error() {
        let cli = parse(&["--config", "/nonexistent/ivsim.toml"]);
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn loopback_provider_uses_configured_identity() {
        let mut config = AppConfig::default();
        config.device.device_id = "iv-pump-03".to_owned();
        config.transport.kind = TransportKind::Loopback;
        let provider = build_provider(&config).expect("provider");
        assert_eq!(provider.device_id(), "iv-pump-03");
    }

    #[test]
    fn transport_flag_selects_hub_protocol() {
        let mut config = AppConfig::default();
        assert_eq!(config.transport.kind, TransportKind::Mqtt);
        apply_overrides(&parse(&["--transport", "https"]), &mut config);
        assert_eq!(config.transport.kind, TransportKind::Https);
        assert!(Cli::try_parse_from(["ivsimd", "--transport", "hub"]).is_err());
    }

    #[test]
    fn version_line_names_the_binary() {
        assert!(version_line().starts_with("ivsimd "));
    }
}
