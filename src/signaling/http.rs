use crate::config::ServerConfig;
use crate::signaling::ice;
use crate::signaling::relay::SignalingRelay;
use log::{info, warn};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::{reject, Filter, Rejection, Reply};

#[derive(Debug)]
struct ServerError(String);

impl reject::Reject for ServerError {}

#[derive(Debug, Deserialize)]
struct IceQuery {
    user: Option<String>,
}

pub fn routes(
    relay: Arc<SignalingRelay>,
    config: Arc<ServerConfig>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let banner = warp::path::end()
        .and(warp::get())
        .map(|| "Video Conference Server");

    let ice_servers = warp::path!("ice-servers")
        .and(warp::get())
        .and(warp::query::<IceQuery>())
        .and(with_config(config))
        .and_then(|query: IceQuery, config: Arc<ServerConfig>| async move {
            let user = query.user.unwrap_or_else(|| "meshcall".to_string());
            match ice::ice_servers(&config, &user) {
                Ok(servers) => Ok(warp::reply::json(&servers)),
                Err(e) => {
                    warn!("Could not build ICE server list: {}", e);
                    Err(reject::custom(ServerError(e.to_string())))
                }
            }
        });

    let rooms = warp::path!("debug" / "rooms")
        .and(warp::get())
        .and(with_relay(relay))
        .map(|relay: Arc<SignalingRelay>| warp::reply::json(&relay.roster().summaries()));

    banner.or(ice_servers).or(rooms)
}

pub async fn run_http_server(relay: Arc<SignalingRelay>, config: Arc<ServerConfig>, addr: SocketAddr) {
    info!("HTTP endpoints listening on {}", addr);
    warp::serve(routes(relay, config)).run(addr).await;
}

fn with_relay(
    relay: Arc<SignalingRelay>,
) -> impl Filter<Extract = (Arc<SignalingRelay>,), Error = Infallible> + Clone {
    warp::any().map(move || relay.clone())
}

fn with_config(
    config: Arc<ServerConfig>,
) -> impl Filter<Extract = (Arc<ServerConfig>,), Error = Infallible> + Clone {
    warp::any().map(move || config.clone())
}
