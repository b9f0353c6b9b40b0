//! Synthetic server-status responses.
//!
//! A [`StatusResponder`] turns the configured online/offline personas into
//! the JSON payload clients render in their server list. Configured fields
//! always win; for the online persona unset fields fall through to the
//! backend's live status, then to neutral defaults.

use crate::config::{OfflineStatusConfig, OnlineStatusConfig, PlayerSampleConfig};
use crate::{ProxyError, Result};
use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Status payload as rendered by the client's server list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusPayload {
    pub version: VersionInfo,
    pub players: PlayersInfo,
    pub description: ChatText,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionInfo {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayersInfo {
    pub max: i32,
    pub online: i32,
    #[serde(default)]
    pub sample: Vec<PlayerSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerSample {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatText {
    pub text: String,
}

impl StatusPayload {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProxyError::status(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ProxyError::status(e.to_string()))
    }
}

/// Builds status payloads for one backend server from its two personas.
#[derive(Debug, Clone)]
pub struct StatusResponder {
    online: OnlineStatusConfig,
    online_icon: Option<String>,
    offline: OfflineStatusConfig,
    offline_icon: Option<String>,
}

impl StatusResponder {
    /// Resolve the personas, loading icon files into `data:` URIs up front
    /// so the hot path never touches the filesystem.
    pub fn from_config(online: &OnlineStatusConfig, offline: &OfflineStatusConfig) -> Result<Self> {
        let online_icon = online.icon_path.as_deref().map(load_icon).transpose()?;
        let offline_icon = offline.icon_path.as_deref().map(load_icon).transpose()?;
        Ok(Self {
            online: online.clone(),
            online_icon,
            offline: offline.clone(),
            offline_icon,
        })
    }

    /// Build the payload for a reachable backend. Configured fields override
    /// the live values; unset fields pass the live value through, or fall
    /// back to a neutral default when no live status is available.
    pub fn online_payload(&self, live: Option<&StatusPayload>) -> StatusPayload {
        let version = VersionInfo {
            name: self
                .online
                .version_name
                .clone()
                .or_else(|| live.map(|l| l.version.name.clone()))
                .unwrap_or_else(|| "Unknown".to_string()),
            protocol: self
                .online
                .protocol_number
                .or(live.map(|l| l.version.protocol))
                .unwrap_or(0),
        };
        let players = PlayersInfo {
            max: self
                .online
                .max_player_count
                .or(live.map(|l| l.players.max))
                .unwrap_or(0),
            online: self
                .online
                .player_count
                .or(live.map(|l| l.players.online))
                .unwrap_or(0),
            sample: self
                .online
                .player_sample
                .as_deref()
                .map(convert_samples)
                .or_else(|| live.map(|l| l.players.sample.clone()))
                .unwrap_or_default(),
        };
        let description = ChatText {
            text: self
                .online
                .motd
                .clone()
                .or_else(|| live.map(|l| l.description.text.clone()))
                .unwrap_or_default(),
        };
        let favicon = self
            .online_icon
            .clone()
            .or_else(|| live.and_then(|l| l.favicon.clone()));

        StatusPayload {
            version,
            players,
            description,
            favicon,
        }
    }

    /// Build the payload for an unreachable backend: the offline persona,
    /// verbatim.
    pub fn offline_payload(&self) -> StatusPayload {
        StatusPayload {
            version: VersionInfo {
                name: self.offline.version_name.clone(),
                protocol: self.offline.protocol_number,
            },
            players: PlayersInfo {
                max: self.offline.max_player_count,
                online: self.offline.player_count,
                sample: convert_samples(&self.offline.player_sample),
            },
            description: ChatText {
                text: self.offline.motd.clone(),
            },
            favicon: self.offline_icon.clone(),
        }
    }
}

/// Generic "server not found" payload built from a gateway's fallback
/// message.
pub fn not_found_payload(message: &str) -> StatusPayload {
    StatusPayload {
        version: VersionInfo {
            name: "Unknown".to_string(),
            protocol: 0,
        },
        players: PlayersInfo {
            max: 0,
            online: 0,
            sample: Vec::new(),
        },
        description: ChatText {
            text: message.to_string(),
        },
        favicon: None,
    }
}

fn convert_samples(samples: &[PlayerSampleConfig]) -> Vec<PlayerSample> {
    samples
        .iter()
        .map(|s| PlayerSample {
            name: s.name.clone(),
            id: s.uuid.clone(),
        })
        .collect()
}

fn load_icon(path: &str) -> Result<String> {
    let bytes = std::fs::read(path)
        .map_err(|e| ProxyError::status(format!("failed to read icon '{path}': {e}")))?;
    Ok(format!(
        "data:image/png;base64,{}",
        BASE64_ENGINE.encode(bytes)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_payload() -> StatusPayload {
        StatusPayload {
            version: VersionInfo {
                name: "1.20.4".to_string(),
                protocol: 765,
            },
            players: PlayersInfo {
                max: 100,
                online: 42,
                sample: vec![PlayerSample {
                    name: "steve".to_string(),
                    id: "00000000-0000-0000-0000-000000000000".to_string(),
                }],
            },
            description: ChatText {
                text: "A live server".to_string(),
            },
            favicon: None,
        }
    }

    #[test]
    fn test_unset_online_fields_pass_live_values_through() {
        let responder =
            StatusResponder::from_config(&OnlineStatusConfig::default(), &Default::default())
                .unwrap();
        let payload = responder.online_payload(Some(&live_payload()));
        assert_eq!(payload, live_payload());
    }

    #[test]
    fn test_configured_fields_override_live_values() {
        let online = OnlineStatusConfig {
            motd: Some("Managed by the gateway".to_string()),
            max_player_count: Some(500),
            ..Default::default()
        };
        let responder = StatusResponder::from_config(&online, &Default::default()).unwrap();
        let payload = responder.online_payload(Some(&live_payload()));
        assert_eq!(payload.description.text, "Managed by the gateway");
        assert_eq!(payload.players.max, 500);
        // Unset fields still carry the live values.
        assert_eq!(payload.players.online, 42);
        assert_eq!(payload.version.protocol, 765);
    }

    #[test]
    fn test_configured_zero_is_not_replaced_by_live_value() {
        let online = OnlineStatusConfig {
            player_count: Some(0),
            ..Default::default()
        };
        let responder = StatusResponder::from_config(&online, &Default::default()).unwrap();
        let payload = responder.online_payload(Some(&live_payload()));
        assert_eq!(payload.players.online, 0);
    }

    #[test]
    fn test_offline_persona_is_served_verbatim() {
        let offline = OfflineStatusConfig {
            motd: "Maintenance".to_string(),
            max_player_count: 0,
            player_count: 0,
            ..Default::default()
        };
        let responder = StatusResponder::from_config(&Default::default(), &offline).unwrap();
        let payload = responder.offline_payload();
        assert_eq!(payload.description.text, "Maintenance");
        assert_eq!(payload.players.max, 0);
        assert_eq!(payload.players.online, 0);
        assert_eq!(payload.version.name, "Offline");
    }

    #[test]
    fn test_offline_payload_is_idempotent() {
        let responder =
            StatusResponder::from_config(&Default::default(), &Default::default()).unwrap();
        assert_eq!(responder.offline_payload(), responder.offline_payload());
    }

    #[test]
    fn test_payload_json_shape() {
        let json = not_found_payload("nope").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["description"]["text"], "nope");
        assert_eq!(value["players"]["max"], 0);
        assert!(value.get("favicon").is_none());
        // Round-trip through the typed representation.
        let parsed = StatusPayload::from_json(&json).unwrap();
        assert_eq!(parsed, not_found_payload("nope"));
    }
}
