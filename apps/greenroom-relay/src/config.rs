use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub session_ttl_seconds: u64,
    pub invite_ttl_seconds: u64,
    pub invite_secret: String,
    pub public_base_url: String,
    pub heartbeat_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("GREENROOM_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            session_ttl_seconds: env::var("GREENROOM_SESSION_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(86_400), // interviews are same-day affairs
            invite_ttl_seconds: env::var("GREENROOM_INVITE_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(604_800), // invites go out up to a week ahead
            invite_secret: env::var("GREENROOM_INVITE_SECRET")
                .unwrap_or_else(|_| "greenroom-dev-secret".to_string()),
            public_base_url: env::var("GREENROOM_PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            heartbeat_timeout_seconds: env::var("GREENROOM_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(120),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            session_ttl_seconds: 86_400,
            invite_ttl_seconds: 604_800,
            invite_secret: "greenroom-dev-secret".to_string(),
            public_base_url: "http://localhost:8080".to_string(),
            heartbeat_timeout_seconds: 120,
        }
    }
}
