//! Lobby account and universe directory types.
//!
//! The lobby exposes two JSON directories: the universes it hosts and the
//! accounts the authenticated user owns. Login resolves a (universe name,
//! language) pair against both to pick the account to play.

use crate::error::SessionError;
use serde::{Deserialize, Deserializer, Serialize};

/// Systems per galaxy is fixed across every universe.
pub const SYSTEMS_PER_GALAXY: i64 = 499;

/// Secrets used against the lobby. Empty strings mean "not configured";
/// a non-empty `bearer_token` skips the credential exchange entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub otp_secret: String,
    pub bearer_token: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn has_bearer_token(&self) -> bool {
        !self.bearer_token.is_empty()
    }
}

/// Which lobby cluster to authenticate against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Lobby {
    #[default]
    Normal,
    Pioneers,
}

impl Lobby {
    fn host_prefix(self) -> &'static str {
        match self {
            Lobby::Normal => "lobby",
            Lobby::Pioneers => "lobby-pioneers",
        }
    }

    pub fn base_url(self) -> String {
        format!("https://{}.ogame.gameforge.com", self.host_prefix())
    }
}

impl std::fmt::Display for Lobby {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.host_prefix())
    }
}

/// One entry of the lobby's `/api/users/me/accounts` listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub server: AccountServer,
    pub last_played: Option<String>,
    pub blocked: bool,
}

/// The universe an account lives on, as the accounts listing tags it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountServer {
    pub language: String,
    pub number: i64,
}

/// One entry of the lobby's `/api/servers` listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Server {
    pub language: String,
    pub number: i64,
    pub name: String,
    pub player_count: i64,
    pub players_online: i64,
    pub opened: String,
    pub start_date: String,
    pub end_date: Option<String>,
    pub server_closed: i64,
    pub prefered: i64,
    pub signup_closed: i64,
    pub settings: ServerSettings,
}

/// Universe rule-set as published by the lobby.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    #[serde(rename = "aKS", alias = "aks")]
    pub aks: i64,
    pub fleet_speed: i64,
    pub wreck_field: i64,
    pub server_label: String,
    // The lobby has served this both as a number and as a string.
    #[serde(deserialize_with = "flexible_i64")]
    pub economy_speed: i64,
    pub planet_fields: i64,
    pub universe_size: i64,
    pub server_category: String,
    pub espionage_probe_raids: i64,
    pub premium_validation_gift: i64,
    pub debris_field_factor_ships: i64,
    pub debris_field_factor_defence: i64,
}

fn flexible_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(s) => s.parse().unwrap_or(0),
    })
}

/// The slice of universe settings the rest of the stack consumes,
/// normalized so zeroed lobby entries never divide anything by zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerData {
    pub name: String,
    pub number: i64,
    pub language: String,
    pub economy_speed: i64,
    pub fleet_speed: i64,
    pub galaxies: i64,
    pub systems: i64,
    pub server_label: String,
    pub server_category: String,
    pub espionage_probe_raids: i64,
    pub debris_field_factor_ships: i64,
    pub debris_field_factor_defence: i64,
}

impl From<&Server> for ServerData {
    fn from(server: &Server) -> Self {
        let settings = &server.settings;
        Self {
            name: server.name.clone(),
            number: server.number,
            language: server.language.clone(),
            economy_speed: settings.economy_speed.max(1),
            fleet_speed: settings.fleet_speed.max(1),
            galaxies: settings.universe_size.max(1),
            systems: SYSTEMS_PER_GALAXY,
            server_label: settings.server_label.clone(),
            server_category: settings.server_category.clone(),
            espionage_probe_raids: settings.espionage_probe_raids,
            debris_field_factor_ships: settings.debris_field_factor_ships,
            debris_field_factor_defence: settings.debris_field_factor_defence,
        }
    }
}

/// Finds the universe named `universe` in `language`, if the lobby lists it.
pub fn find_server<'a>(universe: &str, language: &str, servers: &'a [Server]) -> Option<&'a Server> {
    servers
        .iter()
        .find(|s| s.name == universe && s.language == language)
}

/// Resolves the account to play on `universe`. A `player_id` of zero takes
/// the first account on that universe; otherwise the id must match.
pub fn find_account<'a>(
    universe: &str,
    language: &str,
    player_id: i64,
    accounts: &'a [Account],
    servers: &'a [Server],
) -> Result<(&'a Account, &'a Server), SessionError> {
    // The lobby files "ba" communities under the "yu" group.
    let language = if language == "ba" { "yu" } else { language };
    let server =
        find_server(universe, language, servers).ok_or_else(|| SessionError::UniverseNotFound {
            universe: universe.to_string(),
            language: language.to_string(),
        })?;
    let account = accounts
        .iter()
        .find(|a| {
            a.server.language == server.language
                && a.server.number == server.number
                && (player_id == 0 || a.id == player_id)
        })
        .ok_or(SessionError::AccountNotFound)?;
    Ok((account, server))
}
