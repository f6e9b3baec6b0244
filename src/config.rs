use clap::{Parser, ValueEnum};
use std::str::FromStr;
use std::time::Duration;
use tokio_tungstenite::tungstenite::http::Uri;

use crate::controller::MeshOptions;
use crate::error::{Error, Result};
use crate::negotiation::NegotiationPolicy;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";
const MAX_CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_DELAY_MS: u64 = 1000;

/// Which peers a locally gathered ICE candidate is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CandidateRouting {
    /// Only the peer whose connection gathered it.
    Scoped,
    /// Every registered peer.
    Broadcast,
}

/// Peer-to-peer mesh audio call client
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// WebSocket signaling relay
    #[arg(long, default_value = DEFAULT_SIGNALING_URL, env = "MESH_SIGNALING_URL")]
    pub signaling_url: String,

    /// Room to join
    #[arg(long, env = "MESH_ROOM", conflicts_with = "room_url")]
    pub room: Option<String>,

    /// Room page URL of the form `<scheme>://<host>/<prefix>/<room-id>`
    #[arg(long, env = "MESH_ROOM_URL")]
    pub room_url: Option<String>,

    /// STUN/TURN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = DEFAULT_ICE_SERVER,
        env = "MESH_ICE_SERVERS"
    )]
    pub ice_servers: Vec<String>,

    /// Re-offer when no answer arrives within this many ms; 0 waits forever
    #[arg(long, default_value_t = 0, env = "MESH_NEGOTIATION_TIMEOUT_MS")]
    pub negotiation_timeout_ms: u64,

    /// Re-offers after the first unanswered offer
    #[arg(long, default_value_t = 2, env = "MESH_MAX_OFFER_RETRIES")]
    pub max_offer_retries: u32,

    /// Base delay before a re-offer
    #[arg(long, default_value_t = 500)]
    pub retry_backoff_ms: u64,

    #[arg(long, value_enum, default_value_t = CandidateRouting::Scoped)]
    pub candidate_routing: CandidateRouting,

    /// Attempts to reach the signaling relay before giving up
    #[arg(long, default_value_t = MAX_CONNECT_ATTEMPTS)]
    pub connect_attempts: u32,

    #[arg(long, default_value_t = CONNECT_DELAY_MS)]
    pub connect_delay_ms: u64,

    /// Join without opening the microphone
    #[arg(long, env = "MESH_NO_AUDIO_DEVICE")]
    pub no_audio_device: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", env = "MESH_LOG_LEVEL")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            room: None,
            room_url: None,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            negotiation_timeout_ms: 0,
            max_offer_retries: 2,
            retry_backoff_ms: 500,
            candidate_routing: CandidateRouting::Scoped,
            connect_attempts: MAX_CONNECT_ATTEMPTS,
            connect_delay_ms: CONNECT_DELAY_MS,
            no_audio_device: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn room_id(&self) -> Result<String> {
        match (&self.room, &self.room_url) {
            (Some(room), _) if !room.trim().is_empty() => Ok(room.trim().to_string()),
            (Some(_), _) => Err(Error::Config("room id is empty".to_string())),
            (None, Some(url)) => room_id_from_url(url),
            (None, None) => Err(Error::Config(
                "either --room or --room-url is required".to_string(),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.signaling_url.starts_with("ws://") || self.signaling_url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "signaling url must be ws:// or wss://, got {}",
                self.signaling_url
            )));
        }
        if self.ice_servers.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::Config("empty ICE server entry".to_string()));
        }
        self.room_id().map(|_| ())
    }

    pub fn negotiation_policy(&self) -> NegotiationPolicy {
        NegotiationPolicy {
            answer_timeout: (self.negotiation_timeout_ms > 0)
                .then(|| Duration::from_millis(self.negotiation_timeout_ms)),
            max_offer_retries: self.max_offer_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn mesh_options(&self) -> MeshOptions {
        MeshOptions {
            candidate_routing: self.candidate_routing,
            negotiation: self.negotiation_policy(),
        }
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }
}

/// The room id is the second path segment: `/room/<id>` yields `<id>`.
pub fn room_id_from_url(url: &str) -> Result<String> {
    let uri = Uri::from_str(url).map_err(|e| Error::Config(format!("invalid room url: {}", e)))?;
    uri.path()
        .split('/')
        .nth(2)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Config(format!("no room id in {}", url)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_comes_from_second_path_segment() {
        assert_eq!(room_id_from_url("https://calls.example.com/room/r1").unwrap(), "r1");
        assert_eq!(
            room_id_from_url("http://localhost:3000/room/abc-123?x=1").unwrap(),
            "abc-123"
        );
        assert!(room_id_from_url("http://localhost:3000/").is_err());
        assert!(room_id_from_url("http://localhost:3000/room/").is_err());
    }

    #[test]
    fn explicit_room_wins() {
        let config = Config {
            room: Some(" r1 ".into()),
            ..Default::default()
        };
        assert_eq!(config.room_id().unwrap(), "r1");
        assert!(Config::default().room_id().is_err());
    }

    #[test]
    fn cli_defaults_match_default() {
        let parsed = Config::parse_from(["mesh-call", "--room", "r1"]);
        let defaults = Config::default();
        assert_eq!(parsed.signaling_url, defaults.signaling_url);
        assert_eq!(parsed.ice_servers, defaults.ice_servers);
        assert_eq!(parsed.negotiation_policy(), defaults.negotiation_policy());
        assert_eq!(parsed.candidate_routing, CandidateRouting::Scoped);
    }

    #[test]
    fn answer_timeout_is_opt_in() {
        let parsed = Config::parse_from(["mesh-call", "--room", "r1"]);
        assert!(parsed.negotiation_policy().answer_timeout.is_none());

        let parsed =
            Config::parse_from(["mesh-call", "--room", "r1", "--negotiation-timeout-ms", "8000"]);
        assert_eq!(
            parsed.negotiation_policy().answer_timeout,
            Some(Duration::from_millis(8000))
        );
    }

    #[test]
    fn zero_timeout_disables_retries() {
        let config = Config::parse_from([
            "mesh-call",
            "--room-url",
            "http://h/room/r2",
            "--negotiation-timeout-ms",
            "0",
            "--candidate-routing",
            "broadcast",
            "--ice-servers",
            "stun:a:3478,turn:b:3478",
        ]);
        assert_eq!(config.room_id().unwrap(), "r2");
        assert!(config.negotiation_policy().answer_timeout.is_none());
        assert_eq!(config.candidate_routing, CandidateRouting::Broadcast);
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn rejects_non_websocket_relay() {
        let config = Config {
            room: Some("r1".into()),
            signaling_url: "http://relay".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
