//! # OCPP Fleet CLI
//!
//! Command-line entry point: run a fleet, run one interactive charge point, or manage
//! configuration files.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ocpp_cp::SessionEvent;
use ocpp_fleet::{FleetConfig, FleetEvent, FleetRegistry, LogFormat, LoggingConfig};
use ocpp_transport::{TransportConfig, WebSocketConnector};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "ocpp-fleet")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a fleet and run until Ctrl-C
    Run(FleetArgs),
    /// Run one interactive charge point; exits when the central system resets it
    Single(SingleArgs),
    /// Validate a configuration file
    Validate(ValidateArgs),
    /// Print a default configuration as TOML
    Generate(GenerateArgs),
}

#[derive(Args)]
struct FleetArgs {
    /// Configuration file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Central system URL
    #[arg(short = 'u', long, env = "WS_URL")]
    endpoint: Option<String>,

    /// Basic auth password
    #[arg(long, env = "PASSWORD")]
    password: Option<String>,

    /// Charge point id prefix
    #[arg(long, env = "CP_PREFIX")]
    prefix: Option<String>,

    /// Number of charge points
    #[arg(short = 'n', long, env = "COUNT")]
    count: Option<u32>,

    /// Delay between charge point starts, in milliseconds
    #[arg(long)]
    stagger_ms: Option<u64>,

    /// Charge point model
    #[arg(short, long)]
    model: Option<String>,

    /// Expose connector 0 next to connectors 1 and 2
    #[arg(long)]
    twin_gun: bool,

    /// Run test charges once the fleet is up
    #[arg(long, env = "TEST_CHARGE")]
    test_charge: bool,

    /// Percent chance of each charge point running the test charge
    #[arg(long, env = "START_CHANCE")]
    start_chance: Option<u8>,

    /// Charge duration in minutes
    #[arg(long, env = "CHARGE_LENGTH")]
    duration: Option<u64>,

    /// Charge cycles per connector
    #[arg(long)]
    sessions: Option<u32>,

    /// Honor the vendor's random start delay
    #[arg(long, env = "RANDOM_START")]
    random_delay: bool,

    /// Admin channel port of the first charge point
    #[arg(long, env = "ADMIN_PORT")]
    admin_port: Option<u16>,

    /// Give every charge point its own admin port
    #[arg(long)]
    admin_port_increment: bool,

    /// Log filter, e.g. `info` or `ocpp_cp=debug`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,
}

#[derive(Args)]
struct SingleArgs {
    /// Charge point id; defaults to the first fleet id
    #[arg(short, long, env = "CP_ID")]
    id: Option<String>,

    #[command(flatten)]
    fleet: FleetArgs,
}

#[derive(Args)]
struct ValidateArgs {
    /// Configuration file path
    #[arg(short, long)]
    config: PathBuf,
}

#[derive(Args)]
struct GenerateArgs {
    /// Write to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    match value.to_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "compact" => Ok(LogFormat::Compact),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format {}", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Single(args) => single_command(args).await,
        Commands::Validate(args) => validate_command(args),
        Commands::Generate(args) => generate_command(args),
    }
}

fn load_config(args: &FleetArgs) -> Result<FleetConfig> {
    let mut config = match &args.config {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FleetConfig::default(),
    };

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(password) = &args.password {
        config.basic_auth_password = Some(password.clone());
    }
    if let Some(prefix) = &args.prefix {
        config.id_prefix = prefix.clone();
    }
    if let Some(count) = args.count {
        config.count = count;
    }
    if let Some(stagger_ms) = args.stagger_ms {
        config.stagger_ms = stagger_ms;
    }
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    config.twin_gun |= args.twin_gun;
    config.charge.enabled |= args.test_charge;
    config.charge.random_delay |= args.random_delay;
    if let Some(start_chance) = args.start_chance {
        config.charge.start_chance = start_chance;
    }
    if let Some(duration) = args.duration {
        config.charge.duration_minutes = duration;
    }
    if let Some(sessions) = args.sessions {
        config.charge.session_count = sessions;
    }
    if let Some(admin_port) = args.admin_port {
        config.admin_port = Some(admin_port);
    }
    config.admin_port_increment |= args.admin_port_increment;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    config
        .validate()
        .context("configuration validation failed")?;
    Ok(config)
}

fn registry(config: FleetConfig) -> Result<FleetRegistry> {
    let connector = Arc::new(WebSocketConnector::new(TransportConfig::default()));
    Ok(FleetRegistry::new(config, connector)?)
}

async fn run_command(args: FleetArgs) -> Result<()> {
    let config = load_config(&args)?;
    init_logging(&config.logging)?;

    info!(
        "Starting {} charge points ({}*) against {}",
        config.count, config.id_prefix, config.endpoint
    );
    let registry = Arc::new(registry(config)?);
    let logger = spawn_event_logger(&registry);

    tokio::select! {
        report = registry.start() => {
            let report = report?;
            info!(
                "{} started, {} failed, {} charging",
                report.started.len(),
                report.failed.len(),
                report.charging.len()
            );
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        }
        _ = signal::ctrl_c() => {}
    }

    info!("Received Ctrl-C, shutting down...");
    registry.stop_all().await;
    logger.abort();
    Ok(())
}

async fn single_command(args: SingleArgs) -> Result<()> {
    let mut config = load_config(&args.fleet)?;
    config.count = 1;
    init_logging(&config.logging)?;

    let charge_point_id = args.id.unwrap_or_else(|| config.charge_point_id(1));
    let admin_port = config.admin_port;
    let test_charge = config.charge.enabled;
    let registry = registry(config)?;
    let mut events = registry.subscribe();

    registry.start_one(&charge_point_id, admin_port).await?;
    info!(charge_point_id = %charge_point_id, "Charge point ready, test charge: {}", test_charge);
    if test_charge {
        registry.charge(&charge_point_id).await?;
    }

    let mut reset = ResetWatch::new(&charge_point_id);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    log_event(&event);
                    if reset.observe(&event) {
                        info!(charge_point_id = %charge_point_id, "Reset by the central system, exiting");
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("{} events missed", missed),
                Err(RecvError::Closed) => break,
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down...");
                registry.stop_all().await;
                break;
            }
        }
    }
    Ok(())
}

/// Tells when the single session went down because the central system reset it. Any
/// other close leaves the session Offline and the process running.
struct ResetWatch {
    charge_point_id: String,
    reset_requested: bool,
}

impl ResetWatch {
    fn new(charge_point_id: &str) -> Self {
        Self {
            charge_point_id: charge_point_id.to_string(),
            reset_requested: false,
        }
    }

    /// Returns true once the session closed itself after a ResetRequested.
    fn observe(&mut self, event: &FleetEvent) -> bool {
        let FleetEvent::Session(event) = event else {
            return false;
        };
        if event.charge_point_id() != self.charge_point_id {
            return false;
        }
        match event {
            SessionEvent::ResetRequested { .. } => {
                self.reset_requested = true;
                false
            }
            SessionEvent::Closed { unsolicited, .. } => self.reset_requested && !unsolicited,
            _ => false,
        }
    }
}

fn spawn_event_logger(registry: &FleetRegistry) -> tokio::task::JoinHandle<()> {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => warn!("{} events missed", missed),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &FleetEvent) {
    match serde_json::to_string(event) {
        Ok(json) if event.is_closed() => warn!("{}", json),
        Ok(json) => info!("{}", json),
        Err(e) => error!("Unprintable event {:?}: {}", event, e),
    }
}

fn validate_command(args: ValidateArgs) -> Result<()> {
    println!("Validating configuration: {}", args.config.display());
    let config = FleetConfig::from_file(&args.config)?;

    match config.validate() {
        Ok(()) => {
            println!("✓ Configuration is valid");
            println!();
            println!("  Endpoint: {}", config.endpoint);
            println!(
                "  Charge points: {} ({}1..{}{})",
                config.count, config.id_prefix, config.id_prefix, config.count
            );
            println!("  Model: {} ({} kW)", config.model, config.power_kw);
            println!(
                "  Connectors: {:?}",
                config.session_config(1).connector_ids()
            );
            println!(
                "  Test charge: {} ({}% chance, {} min x {})",
                config.charge.enabled,
                config.charge.start_chance,
                config.charge.duration_minutes,
                config.charge.session_count
            );
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn generate_command(args: GenerateArgs) -> Result<()> {
    let text = FleetConfig::default().to_toml()?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
            println!("Configuration file generated: {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("invalid log level")?;
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
        LogFormat::Compact => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use ocpp_types::v16j::ResetType;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::try_parse_from([
            "ocpp-fleet",
            "run",
            "--endpoint",
            "ws://cs.example:9000",
            "-n",
            "4",
            "--test-charge",
            "--start-chance",
            "50",
            "--log-format",
            "json",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.endpoint, "ws://cs.example:9000");
        assert_eq!(config.count, 4);
        assert!(config.charge.enabled);
        assert_eq!(config.charge.start_chance, 50);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    fn closed(charge_point_id: &str, unsolicited: bool) -> FleetEvent {
        FleetEvent::Session(SessionEvent::Closed {
            charge_point_id: charge_point_id.to_string(),
            code: if unsolicited { 1006 } else { 1000 },
            reason: String::new(),
            unsolicited,
        })
    }

    fn reset_requested(charge_point_id: &str) -> FleetEvent {
        FleetEvent::Session(SessionEvent::ResetRequested {
            charge_point_id: charge_point_id.to_string(),
            reset_type: ResetType::Hard,
        })
    }

    #[test]
    fn test_unsolicited_close_keeps_running() {
        let mut watch = ResetWatch::new("VCP_1");
        assert!(!watch.observe(&closed("VCP_1", true)));
        assert!(!watch.observe(&closed("VCP_1", false)));
    }

    #[test]
    fn test_close_after_reset_exits() {
        let mut watch = ResetWatch::new("VCP_1");
        assert!(!watch.observe(&reset_requested("VCP_2")));
        assert!(!watch.observe(&closed("VCP_1", false)));
        assert!(!watch.observe(&reset_requested("VCP_1")));
        assert!(!watch.observe(&closed("VCP_1", true)));
        assert!(watch.observe(&closed("VCP_1", false)));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let cli = Cli::try_parse_from(["ocpp-fleet", "run", "--start-chance", "150"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(load_config(&args).is_err());
    }
}
