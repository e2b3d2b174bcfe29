//! Cached snapshot of the last full page fetch.
//!
//! Every navigation-style fetch refreshes this snapshot before the
//! response reaches the caller, so readers on other tasks always see
//! state at least as fresh as the last completed fetch.

use std::sync::{PoisonError, RwLock};

use crate::account::ServerData;

/// Galaxy / system / position triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub galaxy: i64,
    pub system: i64,
    pub position: i64,
}

impl Coordinate {
    pub fn new(galaxy: i64, system: i64, position: i64) -> Self {
        Self {
            galaxy,
            system,
            position,
        }
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}:{}]", self.galaxy, self.system, self.position)
    }
}

/// A moon orbiting one of the player's planets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Moon {
    pub id: i64,
    pub name: String,
}

/// One of the player's planets as listed in the page header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Planet {
    pub id: i64,
    pub name: String,
    pub coordinate: Coordinate,
    pub moon: Option<Moon>,
}

impl std::fmt::Display for Planet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.coordinate)
    }
}

/// The account's character class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CharacterClass {
    #[default]
    NoClass,
    Collector,
    General,
    Discoverer,
}

impl CharacterClass {
    /// Maps the numeric id the page markup carries. Unknown ids fall back
    /// to [`CharacterClass::NoClass`].
    pub fn from_id(id: i64) -> Self {
        match id {
            1 => CharacterClass::Collector,
            2 => CharacterClass::General,
            3 => CharacterClass::Discoverer,
            _ => CharacterClass::NoClass,
        }
    }
}

/// Which officers are currently hired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfficerSuite {
    pub commander: bool,
    pub admiral: bool,
    pub engineer: bool,
    pub geologist: bool,
    pub technocrat: bool,
}

/// Identity markers carried by every authenticated overview page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Player {
    pub id: i64,
    pub name: String,
}

/// The slice of account preferences the client reads back after login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preferences {
    pub spio_anz: i64,
    pub events_show: i64,
    pub msg_results_per_page: i64,
    pub show_activity_minutes: bool,
    pub preserve_system_on_planet_change: bool,
    pub disable_chat_bar: bool,
    pub auctioneer_notifications: bool,
    pub vacation_mode: bool,
}

/// Everything a full page fetch can refresh in one shot. `None` fields
/// leave the cached value untouched; list and flag fields always replace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageUpdate {
    pub session: Option<String>,
    pub planets: Vec<Planet>,
    pub vacation: bool,
    pub chat_token: Option<String>,
    pub character_class: Option<CharacterClass>,
    pub officers: OfficerSuite,
}

#[derive(Debug, Default)]
struct CacheState {
    session: String,
    server_data: Option<ServerData>,
    planets: Vec<Planet>,
    vacation: bool,
    chat_token: String,
    character_class: CharacterClass,
    officers: OfficerSuite,
    player: Option<Player>,
    preferences: Preferences,
}

/// Shared session snapshot. All getters clone out of a read lock, so a
/// reader never observes a half-applied page update.
#[derive(Debug, Default)]
pub struct SessionCache {
    inner: RwLock<CacheState>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a full page refresh under one write lock.
    pub fn apply_page(&self, update: PageUpdate) {
        let mut state = self.write();
        if let Some(session) = update.session {
            if !session.is_empty() {
                state.session = session;
            }
        }
        state.planets = update.planets;
        state.vacation = update.vacation;
        if let Some(token) = update.chat_token {
            state.chat_token = token;
        }
        if let Some(class) = update.character_class {
            state.character_class = class;
        }
        state.officers = update.officers;
    }

    pub fn session(&self) -> String {
        self.read().session.clone()
    }

    pub fn set_server_data(&self, server_data: ServerData) {
        self.write().server_data = Some(server_data);
    }

    pub fn server_data(&self) -> Option<ServerData> {
        self.read().server_data.clone()
    }

    pub fn planets(&self) -> Vec<Planet> {
        self.read().planets.clone()
    }

    pub fn planet_by_id(&self, id: i64) -> Option<Planet> {
        self.read().planets.iter().find(|p| p.id == id).cloned()
    }

    pub fn is_in_vacation(&self) -> bool {
        self.read().vacation
    }

    /// Token required by chat-style form posts. Replaced whenever a
    /// response hands out a fresh one.
    pub fn chat_token(&self) -> String {
        self.read().chat_token.clone()
    }

    pub fn set_chat_token(&self, token: impl Into<String>) {
        self.write().chat_token = token.into();
    }

    pub fn character_class(&self) -> CharacterClass {
        self.read().character_class
    }

    pub fn officers(&self) -> OfficerSuite {
        self.read().officers
    }

    pub fn player(&self) -> Option<Player> {
        self.read().player.clone()
    }

    pub fn set_player(&self, player: Player) {
        self.write().player = Some(player);
    }

    pub fn preferences(&self) -> Preferences {
        self.read().preferences.clone()
    }

    pub fn set_preferences(&self, preferences: Preferences) {
        self.write().preferences = preferences;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
