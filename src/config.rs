//! Runtime configuration assembled from environment variables.
//!
//! Binaries build an `AppConfig` with `from_env()` and then apply CLI flag
//! overrides on top of it.

use std::path::PathBuf;
use std::time::Duration;

use crate::discord::DEFAULT_API_BASE;
use crate::push::{PushConfig, PusherCredentials};

pub const DEFAULT_HTTP_PORT: u16 = 7878;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
/// App key served by the local push hub.
pub const LOCAL_PUSH_KEY: &str = "armory-local";

pub fn parse_port_env(value: Option<String>) -> Option<u16> {
    value.and_then(|v| v.trim().parse::<u16>().ok())
}

pub fn parse_bool_env(value: Option<String>) -> Option<bool> {
    let v = value?.trim().to_lowercase();
    match v.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Guild membership plus role a user must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRequirement {
    pub guild_id: String,
    pub role_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscordConfig {
    pub api_base: String,
    pub guild_id: Option<String>,
    pub required_role_id: Option<String>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self { api_base: DEFAULT_API_BASE.to_string(), guild_id: None, required_role_id: None }
    }
}

impl DiscordConfig {
    /// `None` when either id is missing; role checks then pass everyone.
    pub fn requirement(&self) -> Option<RoleRequirement> {
        Some(RoleRequirement { guild_id: self.guild_id.clone()?, role_id: self.required_role_id.clone()? })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: String,
    pub http_port: u16,
    /// JSON data file; `None` keeps everything in memory.
    pub data_file: Option<PathBuf>,
    pub session_ttl: Duration,
    /// On a denied role check, also delete the user's accounts and user row.
    pub deprovision_on_denied: bool,
    pub discord: DiscordConfig,
    pub push: PushConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            data_file: None,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            deprovision_on_denied: true,
            discord: DiscordConfig::default(),
            push: PushConfig::Disabled,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        // Pusher credentials win over the local hub when both are set.
        let push = match PusherCredentials::from_lookup(&get) {
            Some(creds) => PushConfig::Pusher(creds),
            None if parse_bool_env(get("ARMORY_LOCAL_PUSH")).unwrap_or(false) => {
                PushConfig::Local { key: LOCAL_PUSH_KEY.to_string() }
            }
            None => PushConfig::Disabled,
        };
        Self {
            bind: non_empty(get("ARMORY_BIND")).unwrap_or(defaults.bind),
            http_port: parse_port_env(get("ARMORY_HTTP_PORT")).unwrap_or(defaults.http_port),
            data_file: non_empty(get("ARMORY_DATA_FILE")).map(PathBuf::from),
            session_ttl: get("ARMORY_SESSION_TTL_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_ttl),
            deprovision_on_denied: parse_bool_env(get("ARMORY_DEPROVISION_ON_DENIED"))
                .unwrap_or(defaults.deprovision_on_denied),
            discord: DiscordConfig {
                api_base: non_empty(get("DISCORD_API_BASE")).unwrap_or(defaults.discord.api_base),
                guild_id: non_empty(get("DISCORD_GUILD_ID")),
                required_role_id: non_empty(get("DISCORD_REQUIRED_ROLE_ID")),
            },
            push,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.http_port)
    }

    pub fn push_backend(&self) -> &'static str {
        match self.push {
            PushConfig::Disabled => "disabled",
            PushConfig::Pusher(_) => "pusher",
            PushConfig::Local { .. } => "local",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let cfg = AppConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.http_port, 7878);
        assert_eq!(cfg.addr(), "0.0.0.0:7878");
        assert_eq!(cfg.data_file, None);
        assert_eq!(cfg.session_ttl, Duration::from_secs(604800));
        assert!(cfg.deprovision_on_denied);
        assert_eq!(cfg.push, PushConfig::Disabled);
        assert_eq!(cfg.discord.requirement(), None);
    }

    #[test]
    fn reads_overrides() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("ARMORY_HTTP_PORT", "9000"),
            ("ARMORY_DATA_FILE", "/tmp/armory.json"),
            ("ARMORY_DEPROVISION_ON_DENIED", "off"),
            ("ARMORY_LOCAL_PUSH", "yes"),
            ("DISCORD_GUILD_ID", "g1"),
            ("DISCORD_REQUIRED_ROLE_ID", "r1"),
        ]));
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.data_file, Some(PathBuf::from("/tmp/armory.json")));
        assert!(!cfg.deprovision_on_denied);
        assert_eq!(cfg.push_backend(), "local");
        assert_eq!(cfg.discord.requirement(), Some(RoleRequirement { guild_id: "g1".into(), role_id: "r1".into() }));
    }

    #[test]
    fn role_requirement_needs_both_ids() {
        let cfg = AppConfig::from_lookup(lookup(&[("DISCORD_GUILD_ID", "g1"), ("DISCORD_REQUIRED_ROLE_ID", " ")]));
        assert_eq!(cfg.discord.requirement(), None);
    }

    #[test]
    fn pusher_credentials_take_precedence() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("PUSHER_APP_ID", "1"),
            ("PUSHER_KEY", "k"),
            ("PUSHER_SECRET", "s"),
            ("PUSHER_CLUSTER", "eu"),
            ("ARMORY_LOCAL_PUSH", "true"),
        ]));
        assert_eq!(cfg.push_backend(), "pusher");
    }

    #[test]
    fn bool_and_port_parsing() {
        assert_eq!(parse_bool_env(Some("ON".into())), Some(true));
        assert_eq!(parse_bool_env(Some("maybe".into())), None);
        assert_eq!(parse_port_env(Some("70000".into())), None);
        assert_eq!(parse_port_env(Some(" 8080 ".into())), Some(8080));
    }
}
