use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub ice_servers: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let ice_servers = env::var("COVE_STUN_SERVERS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|server| server.trim().to_string())
                    .filter(|server| !server.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or_else(default_ice_servers);

        Self {
            port: env::var("COVE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            ice_servers,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            ice_servers: default_ice_servers(),
        }
    }
}

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
