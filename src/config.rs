use std::env;

pub const DEFAULT_SIGNAL_KEY: &str = "fallback-secret-key";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub ws_port: u16,
    pub http_port: u16,
    pub stun_urls: Vec<String>,
    pub turn_server: Option<String>,
    pub turn_port: u16,
    pub turn_secret: Option<String>,
    pub turn_ttl_secs: u64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            ws_port: env::var("WS_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            http_port: env::var("HTTP_PORT")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .unwrap_or(5000),
            stun_urls: env::var("STUN_URLS")
                .map(|v| split_list(&v))
                .unwrap_or_else(|_| vec!["stun:stun.l.google.com:19302".to_string()]),
            turn_server: env::var("TURN_SERVER").ok(),
            turn_port: env::var("TURN_PORT")
                .unwrap_or_else(|_| "3478".to_string())
                .parse()
                .unwrap_or(3478),
            turn_secret: env::var("TURN_SECRET").ok(),
            turn_ttl_secs: env::var("TURN_TTL_SECS")
                .unwrap_or_else(|_| "43200".to_string())
                .parse()
                .unwrap_or(12 * 3600),
        }
    }

    pub fn ws_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.ws_port)
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub signal_key: String,
    pub ice_urls: Vec<String>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            signaling_url: env::var("SIGNALING_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8080".to_string()),
            signal_key: env::var("SIGNAL_KEY")
                .unwrap_or_else(|_| DEFAULT_SIGNAL_KEY.to_string()),
            ice_urls: env::var("ICE_URLS")
                .map(|v| split_list(&v))
                .unwrap_or_else(|_| vec!["stun:stun.l.google.com:19302".to_string()]),
        }
    }

    pub fn uses_default_key(&self) -> bool {
        self.signal_key == DEFAULT_SIGNAL_KEY
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_comma_separated_urls() {
        assert_eq!(
            split_list("stun:a:3478, turn:b:3478,,"),
            vec!["stun:a:3478".to_string(), "turn:b:3478".to_string()]
        );
    }

    #[test]
    fn ws_address_joins_host_and_port() {
        let config = ServerConfig {
            bind_address: "127.0.0.1".into(),
            ws_port: 9000,
            http_port: 9001,
            stun_urls: vec![],
            turn_server: None,
            turn_port: 3478,
            turn_secret: None,
            turn_ttl_secs: 60,
        };
        assert_eq!(config.ws_address(), "127.0.0.1:9000");
    }
}
