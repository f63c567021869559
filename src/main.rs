use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use service_reach_agent::device::JsonRpcDevice;
use service_reach_agent::{observability, Agent, AgentConfig, Error};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent
    Run(RunArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Name the agent registers under with the device
    #[arg(long, env = "AGENT_NAME", default_value = "kbutler")]
    agent_name: String,

    /// Device management service URL
    #[arg(long, env = "DEVICE_URL", default_value = "http://localhost:50053")]
    device_url: String,

    /// Telemetry root for everything the agent publishes
    #[arg(long, env = "YANG_ROOT", default_value = ".kbutler")]
    yang_root: String,

    /// Config roots whose committed changes are applied (defaults to the telemetry root)
    #[arg(long = "watched-root", env = "WATCHED_ROOTS", value_delimiter = ',')]
    watched_roots: Vec<String>,

    /// Network instance whose route table is inspected
    #[arg(long, env = "NETWORK_INSTANCE", default_value = "default")]
    network_instance: String,

    /// Kubernetes node this agent runs on
    #[arg(long, env = "KUBERNETES_NODE_NAME")]
    node_name: Option<String>,

    #[arg(long, env = "POD_COUNT_INTERVAL_SECS", default_value_t = 5)]
    pod_count_interval_secs: u64,

    /// Deadline for agent registration
    #[arg(long, env = "REGISTER_TIMEOUT_SECS", default_value_t = 5)]
    register_timeout_secs: u64,

    /// Attempts before a notification stream failure is fatal
    #[arg(long, env = "STREAM_MAX_ATTEMPTS", default_value_t = 5)]
    stream_max_attempts: u32,

    /// REST API port
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    api_port: u16,
}

impl RunArgs {
    fn into_config(self) -> AgentConfig {
        let node_name = self.node_name.or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
        });
        AgentConfig {
            agent_name: self.agent_name,
            device_url: self.device_url,
            yang_root: self.yang_root,
            watched_roots: self.watched_roots,
            network_instance: self.network_instance,
            node_name,
            pod_count_interval: Duration::from_secs(self.pod_count_interval_secs),
            register_timeout: Duration::from_secs(self.register_timeout_secs),
            stream_max_attempts: self.stream_max_attempts,
            api_port: self.api_port,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Service Reach Agent v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_agent(run_args.into_config()).await,
    }
}

async fn run_agent(config: AgentConfig) -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_target(true);

    // Stdout logging plus OpenTelemetry export when an OTLP endpoint is set
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(observability::init_telemetry(&config.agent_name))
        .init();

    if observability::otel_enabled() {
        info!("OpenTelemetry tracing initialized");
    } else {
        info!(
            "OpenTelemetry tracing disabled ({} not set)",
            observability::OTLP_ENDPOINT_ENV
        );
    }

    info!("Starting Service Reach Agent v{}", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    let device = Arc::new(JsonRpcDevice::new(
        config.device_url.clone(),
        config.agent_name.clone(),
        config.register_timeout,
    )?);

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let agent = Agent::new(config, device.clone(), device.clone(), device);

    #[cfg(feature = "rest-api")]
    {
        let api_state = Arc::new(service_reach_agent::rest_api::ApiState {
            agent_name: agent.config().agent_name.clone(),
            agent: agent.publisher(),
        });
        let port = agent.config().api_port;
        tokio::spawn(async move {
            if let Err(e) = service_reach_agent::rest_api::run_server(api_state, port).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    let result = agent.run(client).await;

    // Flush any remaining traces
    observability::shutdown_telemetry();

    result
}
