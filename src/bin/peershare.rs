//! peershare binary
//!
//! Usage: peershare [OPTIONS]
//!
//! Options:
//!   -g, --generate         Generate a new configuration
//!   -n, --nat <FILE>       Run the NAT allocation frontend
//!   -l, --loopback <FILE>  Run a consenting proxy/relay pair in-process
//!   -h, --help             Print help information

use std::env;
use std::sync::Arc;
use std::time::Duration;

use peershare::config::ProxyConfigFile;
use peershare::consent::ConsentAction;
use peershare::nat::{serve_udp, NatAllocationFrontend};
use peershare::peer::{ChannelMessenger, InstanceHandshake, PeerMessage};
use peershare::transport::LoopbackConnector;
use peershare::{Controller, ProxyConfig};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// How often the loopback mode logs its metrics report.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-n" | "--nat" => {
            if args.len() < 3 {
                eprintln!("Error: --nat requires a config file path");
                return Ok(());
            }
            run_nat(&args[2]).await?;
        }
        "-l" | "--loopback" => {
            if args.len() < 3 {
                eprintln!("Error: --loopback requires a config file path");
                return Ok(());
            }
            run_loopback(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"peershare - share egress with a peer you trust

USAGE:
    peershare [OPTIONS]

OPTIONS:
    -g, --generate          Generate a new configuration
    -n, --nat <FILE>        Run the NAT allocation frontend
    -l, --loopback <FILE>   Run a consenting proxy/relay pair in-process
    -h, --help              Print help information

EXAMPLES:
    Generate a new configuration:
        peershare --generate > peershare.toml

    Serve ALLOCATE requests:
        peershare --nat peershare.toml

    Proxy local SOCKS5 traffic through the relay code path:
        peershare --loopback peershare.toml
        curl --socks5 127.0.0.1:9999 https://example.com
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config = ProxyConfig::new_random("127.0.0.1", peershare::config::DEFAULT_SOCKS_PORT);
    let config_file = ProxyConfigFile::from_config(&config);

    println!("# peershare configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", toml::to_string_pretty(&config_file)?);
    println!();
    println!("# NAT credentials for allocation clients:");
    println!("#   username: {}", config.nat.username);
    println!("#   realm:    {}", config.nat.realm);

    Ok(())
}

fn load_config(config_path: &str) -> anyhow::Result<ProxyConfig> {
    let content = std::fs::read_to_string(config_path)?;
    let config_file: ProxyConfigFile = toml::from_str(&content)?;
    let config = config_file.to_config().map_err(|e: String| anyhow::anyhow!(e))?;
    config.validate().map_err(|e: String| anyhow::anyhow!(e))?;
    Ok(config)
}

async fn run_nat(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    tracing::info!("Realm: {}", config.nat.realm);
    tracing::info!(
        "Relay endpoints: {}:{}-{}",
        config.nat.relay_address,
        config.nat.relay_port_range.0,
        config.nat.relay_port_range.1
    );

    let socket = UdpSocket::bind(&config.nat.listen_addr).await?;
    let frontend = Arc::new(NatAllocationFrontend::new(config.nat)?);
    serve_udp(socket, frontend).await?;

    Ok(())
}

/// Forward one instance's outbound peer messages to the other.
fn pump(
    from: String,
    mut outbox: mpsc::UnboundedReceiver<(String, PeerMessage)>,
    to: Arc<Controller>,
) {
    tokio::spawn(async move {
        while let Some((_, message)) = outbox.recv().await {
            if let Err(e) = to.on_message_from_peer(&from, message) {
                tracing::warn!("Dropped message from {}: {}", from, e);
            }
        }
    });
}

async fn run_loopback(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    let local_id = config.instance_id.clone();
    let relay_id = format!("{}-relay", local_id);
    let mut relay_config = config.clone();
    relay_config.instance_id = relay_id.clone();

    let (local_messenger, local_outbox) = ChannelMessenger::new();
    let (relay_messenger, relay_outbox) = ChannelMessenger::new();
    let (local_connector, dialed) = LoopbackConnector::new(local_id.clone());
    let (relay_connector, _relay_dialed) = LoopbackConnector::new(relay_id.clone());

    let local = Arc::new(Controller::new(
        config,
        InstanceHandshake::new(local_id.clone(), "loopback"),
        Arc::new(local_messenger),
        Arc::new(local_connector),
    ));
    let relay = Arc::new(Controller::new(
        relay_config,
        InstanceHandshake::new(relay_id.clone(), "loopback"),
        Arc::new(relay_messenger),
        Arc::new(relay_connector),
    ));

    pump(local_id.clone(), local_outbox, Arc::clone(&relay));
    pump(relay_id.clone(), relay_outbox, Arc::clone(&local));
    tokio::spawn(Arc::clone(&relay).run_incoming(dialed));

    local.introduce(&relay_id)?;
    wait_for(|| local.registry().get(&relay_id).is_some()).await?;

    local.modify_consent(&relay_id, ConsentAction::Request)?;
    wait_for(|| {
        relay
            .registry()
            .trust(&local_id)
            .is_some_and(|t| t.client_consent.remote_is_requesting())
    })
    .await?;
    relay.modify_consent(&local_id, ConsentAction::AllowRequest)?;
    wait_for(|| local.registry().is_proxy_granted(&relay_id)).await?;

    let socks = local.start(&relay_id).await?;
    tracing::info!("SOCKS5 proxy listening on {}", socks);

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                for line in relay.metrics().format_report().lines() {
                    tracing::info!("{}", line);
                }
            }
        }
    }

    local.stop();
    tracing::info!("Shut down");
    Ok(())
}

/// Poll `check` until it holds, for up to five seconds.
async fn wait_for(mut check: impl FnMut() -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("loopback peers did not reach consent"))
}
