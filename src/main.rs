use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use log::{info, warn};
use meshcall::client::{MeshCoordinator, MeshEvent, RtcTransportFactory, SignalingClient, SyntheticDevices};
use meshcall::config::{ClientConfig, ServerConfig};
use meshcall::room::RosterStore;
use meshcall::signaling::http::run_http_server;
use meshcall::signaling::{MessageHandler, SignalCodec, SignalingRelay, SignalingServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("meshcall")
        .about("Full-mesh video call signaling relay and headless participant")
        .subcommand(
            Command::new("serve")
                .about("Run the signaling relay (default)")
                .arg(Arg::new("ws-port").long("ws-port").takes_value(true))
                .arg(Arg::new("http-port").long("http-port").takes_value(true)),
        )
        .subcommand(
            Command::new("join")
                .about("Join a room as a headless participant")
                .arg(Arg::new("room").long("room").takes_value(true).required(true))
                .arg(Arg::new("name").long("name").takes_value(true).default_value("meshcall-bot"))
                .arg(Arg::new("url").long("url").takes_value(true)),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("join", args)) => join(args).await,
        Some(("serve", args)) => serve(Some(args)).await,
        _ => serve(None).await,
    }
}

async fn serve(args: Option<&ArgMatches>) -> Result<()> {
    let mut config = ServerConfig::from_env();
    if let Some(port) = args.and_then(|a| a.value_of("ws-port")) {
        config.ws_port = port.parse()?;
    }
    if let Some(port) = args.and_then(|a| a.value_of("http-port")) {
        config.http_port = port.parse()?;
    }
    let config = Arc::new(config);

    let relay = Arc::new(SignalingRelay::new(Arc::new(RosterStore::new())));
    let http_addr: SocketAddr = format!("{}:{}", config.bind_address, config.http_port).parse()?;
    tokio::spawn(run_http_server(relay.clone(), config.clone(), http_addr));

    info!("Starting signaling relay on {}", config.ws_address());
    let server = SignalingServer::new(config.ws_address(), Arc::new(MessageHandler::new(relay)));
    server.run().await?;
    Ok(())
}

async fn join(args: &ArgMatches) -> Result<()> {
    let mut config = ClientConfig::from_env();
    if let Some(url) = args.value_of("url") {
        config.signaling_url = url.to_string();
    }
    if config.uses_default_key() {
        warn!("SIGNAL_KEY is not set; signaling payloads use the shared fallback key");
    }
    let room = args.value_of("room").unwrap_or_default().to_string();
    let name = args.value_of("name").unwrap_or("meshcall-bot").to_string();

    let signaling = SignalingClient::connect(&config.signaling_url).await?;
    let (coordinator, session_events) = MeshCoordinator::new(
        name.clone(),
        Arc::new(SignalCodec::from_passphrase(&config.signal_key)),
        Arc::new(RtcTransportFactory::new(config.ice_urls.clone())),
        Arc::new(SyntheticDevices::new(name, false)),
        signaling.outbound.clone(),
    );

    let mut events = coordinator.subscribe();
    let mut driver = tokio::spawn(coordinator.clone().run(signaling.inbound, session_events));

    coordinator.join(&room).await?;
    loop {
        match events.recv().await {
            Ok(MeshEvent::Welcomed { local_id }) => {
                info!("In room {} as {}", room, local_id);
                break;
            }
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => anyhow::bail!("relay closed before assigning an id"),
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => info!("{:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} mesh events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = &mut driver => {
                info!("Relay connection closed");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    coordinator.leave().await;
    driver.abort();
    Ok(())
}
