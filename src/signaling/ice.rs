//! STUN/TURN addresses handed to clients. NAT traversal itself happens in
//! external servers; the relay only mints time-limited TURN credentials in the
//! shared-secret REST scheme (`expiry:user`, base64 HMAC-SHA1).

use crate::config::ServerConfig;
use crate::utils::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
    pub ttl: u64,
}

impl TurnCredentials {
    pub fn new(secret: &str, user: &str, ttl: u64, now: i64) -> Result<Self> {
        let expires = now + ttl as i64;
        let username = format!("{}:{}", expires, user);

        let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
            .map_err(|e| Error::Config(format!("TURN secret rejected: {}", e)))?;
        mac.update(username.as_bytes());
        let password = STANDARD.encode(mac.finalize().into_bytes());

        Ok(TurnCredentials { username, password, ttl })
    }
}

pub fn ice_servers(config: &ServerConfig, user: &str) -> Result<Vec<IceServer>> {
    let mut servers = Vec::new();
    if !config.stun_urls.is_empty() {
        servers.push(IceServer {
            urls: config.stun_urls.clone(),
            username: None,
            credential: None,
        });
    }

    if let (Some(host), Some(secret)) = (&config.turn_server, &config.turn_secret) {
        let creds = TurnCredentials::new(secret, user, config.turn_ttl_secs, Utc::now().timestamp())?;
        servers.push(IceServer {
            urls: vec![
                format!("turn:{}:{}?transport=udp", host, config.turn_port),
                format!("turn:{}:{}?transport=tcp", host, config.turn_port),
            ],
            username: Some(creds.username),
            credential: Some(creds.password),
        });
    }
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(turn: bool) -> ServerConfig {
        ServerConfig {
            bind_address: "0.0.0.0".into(),
            ws_port: 8080,
            http_port: 5000,
            stun_urls: vec!["stun:stun.example.org:3478".into()],
            turn_server: turn.then(|| "turn.example.org".to_string()),
            turn_port: 3478,
            turn_secret: turn.then(|| "s3cret".to_string()),
            turn_ttl_secs: 600,
        }
    }

    #[test]
    fn credentials_are_deterministic_for_a_timestamp() {
        let a = TurnCredentials::new("s3cret", "meshcall", 600, 1_700_000_000).unwrap();
        let b = TurnCredentials::new("s3cret", "meshcall", 600, 1_700_000_000).unwrap();
        assert_eq!(a.username, "1700000600:meshcall");
        assert_eq!(a.password, b.password);
        assert_eq!(STANDARD.decode(&a.password).unwrap().len(), 20);
    }

    #[test]
    fn turn_entry_only_with_secret() {
        assert_eq!(ice_servers(&config(false), "u").unwrap().len(), 1);

        let servers = ice_servers(&config(true), "u").unwrap();
        assert_eq!(servers.len(), 2);
        assert!(servers[1].urls[0].starts_with("turn:turn.example.org:3478"));
        assert!(servers[1].username.as_deref().unwrap().ends_with(":u"));
    }
}
