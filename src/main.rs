use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use santricity_csi::array::{ArrayClient, RestArrayClient};
use santricity_csi::config::{ArrayConfig, Config, PortalStrategy};
use santricity_csi::identity::DRIVER_NAME;
use santricity_csi::types::{Endpoint, ISCSI_PORT};
use santricity_csi::{ControllerService, NodeService, driver, iscsi, metrics};

/// Web Services requests that take longer than this have failed on the array
/// side anyway.
const ARRAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Parser, Debug)]
#[command(name = "santricity-csi")]
#[command(about = "SANtricity iSCSI CSI driver for Kubernetes")]
struct Args {
    /// CSI endpoint (unix:///path/to.sock or tcp://host:port)
    #[arg(
        long,
        env = "CSI_ENDPOINT",
        default_value = "unix:///var/lib/kubelet/plugins/csi.santricity.io/csi.sock"
    )]
    endpoint: String,

    /// Node ID reported to the orchestrator; the locally read initiator IQN
    /// takes precedence when the node service is enabled
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Run the controller service
    #[arg(long)]
    controller: bool,

    /// Run the node service
    #[arg(long)]
    node: bool,

    /// SANtricity Web Services API URL (e.g., https://array:8443)
    #[arg(long, env = "SANTRICITY_API_URL")]
    api_url: Option<String>,

    /// Web Services username
    #[arg(long, env = "SANTRICITY_USERNAME", default_value = "admin")]
    username: String,

    /// Web Services password
    #[arg(long, env = "SANTRICITY_PASSWORD", default_value = "")]
    password: String,

    /// Storage-system identifier within Web Services ("1" for embedded)
    #[arg(long, env = "SANTRICITY_ARRAY_ID", default_value = "1")]
    array_id: String,

    /// Host-type index assigned to hosts the driver creates (28 = Linux DM-MP)
    #[arg(long, default_value = "28")]
    host_type: u32,

    /// Verify the array's TLS certificate
    #[arg(long)]
    verify_tls: bool,

    /// Explicit iSCSI data portal (ip[:port]); when unset the portal is taken
    /// from the array's controller interfaces
    #[arg(long, env = "SANTRICITY_ISCSI_PORTAL")]
    iscsi_portal: Option<String>,

    /// Fallback portal when the array lists no controller addresses
    #[arg(long, default_value = "127.0.0.1")]
    portal_fallback: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    // No role flags means both roles (single-binary deployments)
    let (controller_mode, node_mode) = if !args.controller && !args.node {
        (true, true)
    } else {
        (args.controller, args.node)
    };

    // Resolve the node identity before any service exists. On a node, the
    // initiator IQN is the identity the controller will look hosts up by, so
    // it wins over the operator-supplied ID.
    let node_id = match (node_mode, iscsi::read_initiator_name()) {
        (true, Ok(iqn)) => {
            info!(iqn = %iqn, "Using local initiator IQN as node ID");
            iqn
        }
        (true, Err(e)) => {
            warn!(error = %e, "Could not read initiator IQN, falling back to configured node ID");
            fallback_node_id(args.node_id.as_deref())?
        }
        (false, _) => fallback_node_id(args.node_id.as_deref())?,
    };

    let portals = match &args.iscsi_portal {
        Some(portal) => PortalStrategy::Explicit(Endpoint::parse(portal, ISCSI_PORT)?),
        None => PortalStrategy::ArrayInterfaces {
            fallback: Endpoint::parse(&args.portal_fallback, ISCSI_PORT)?,
        },
    };

    let config = Config {
        endpoint: args.endpoint.clone(),
        node_id,
        controller: controller_mode,
        node: node_mode,
        array: args.api_url.as_ref().map(|api_url| ArrayConfig {
            api_url: api_url.clone(),
            username: args.username.clone(),
            password: args.password.clone(),
            array_id: args.array_id.clone(),
            host_type_index: args.host_type,
            verify_tls: args.verify_tls,
            timeout: ARRAY_REQUEST_TIMEOUT,
        }),
        portals,
    };

    info!("Starting {} on {}", DRIVER_NAME, config.endpoint);
    info!("Node ID: {}", config.node_id);
    info!("Controller mode: {}", config.controller);
    info!("Node mode: {}", config.node);

    let array_client: Option<Arc<dyn ArrayClient>> = match &config.array {
        Some(array_config) => {
            let client = RestArrayClient::new(array_config)
                .map_err(|e| format!("Failed to build array client: {}", e))?;
            Some(Arc::new(client))
        }
        None => {
            if config.controller {
                warn!("No array API URL configured; controller RPCs will fail until one is set");
            }
            None
        }
    };

    // Startup reachability check; failure is logged, not fatal, so the
    // driver can come up before the array does.
    if let Some(ref client) = array_client {
        match client.storage_system().await {
            Ok(system) => {
                info!(array = %system.name, "Connected to storage array");
                metrics::set_array_reachable(true);
            }
            Err(e) => {
                warn!(error = %e, "Storage array is not reachable yet");
                metrics::set_array_reachable(false);
            }
        }
    }

    let controller = config
        .controller
        .then(|| ControllerService::new(array_client.clone(), config.portals.clone()));
    let node = NodeService::new(config.node_id.clone(), Arc::new(iscsi::OpenIscsi));

    driver::serve(&config.endpoint, controller, node).await
}

fn fallback_node_id(configured: Option<&str>) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(id) = configured
        && !id.is_empty()
    {
        return Ok(id.to_string());
    }
    let name = hostname::get()?;
    Ok(name.to_string_lossy().to_string())
}
