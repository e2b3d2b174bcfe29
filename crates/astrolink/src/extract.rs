//! Page markers the client itself depends on.
//!
//! The pipeline needs just enough markup awareness to answer "is this
//! response still authenticated?" and to refresh the cached snapshot:
//! session marker, planet list, vacation flag, tokens, perks, and the
//! stream endpoint. Richer per-page parsing stays outside the client
//! behind the [`Extractor`] seam, selected by server [`Version`].

use std::sync::LazyLock;

use astrolink_protocol::{Dialect, StreamEndpoint};
use astrolink_session::{
    CharacterClass, Coordinate, Moon, OfficerSuite, PageUpdate, Planet, Player, Preferences,
};
use regex::Regex;

static VERSION_META: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta name="ogame-version" content="([^"]+)""#).expect("valid regex")
});
static SESSION_META: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta name="ogame-session" content="(\w+)""#).expect("valid regex")
});
static SESSION_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"var session = "(\w+)""#).expect("valid regex"));
static PLANET_DIV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<div class="smallplanet[^"]*" id="planet-(\d+)""#).expect("valid regex")
});
static CELESTIAL_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<b>([^\[]*) \[(\d+):(\d+):(\d+)]</b>").expect("valid regex"));
static MOON_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<a[^>]*class="[^"]*moonlink[^>]*>"#).expect("valid regex"));
static CELESTIAL_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cp=(\d+)").expect("valid regex"));
static ADVICE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)id="advice-bar".{0,200}?<a href="([^"]+)""#).expect("valid regex")
});
static CHARACTER_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)id="characterclass".{0,200}?class="[^"]*\b(miner|warrior|explorer)\b"#)
        .expect("valid regex")
});
static OFFICER_ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<a[^>]*class="([^"]*\b(commander|admiral|engineer|geologist|technocrat)\b[^"]*)""#)
        .expect("valid regex")
});
static CHAT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"ajaxChatToken\s*=\s*['"](\w+)['"]"#).expect("valid regex"));
static PLAYER_ID_META: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta name="ogame-player-id" content="(\d+)""#).expect("valid regex")
});
static PLAYER_NAME_META: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta name="ogame-player-name" content="([^"]+)""#).expect("valid regex")
});
static SELECT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<select[^>]*name="(\w+)"[^>]*>(.*?)</select>"#).expect("valid regex")
});
static OPTION_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<option[^>]*value="(\d+)"[^>]*>"#).expect("valid regex"));
static INPUT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<input[^>]+>").expect("valid regex"));

fn parse_i64(digits: &str) -> i64 {
    digits.parse().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Server version as reported by the page's `ogame-version` meta tag.
///
/// Ordering is pre-release aware: `8.7.4-rc2 < 8.7.4-pl3 < 8.7.4`, which
/// is what the generation thresholds below rely on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub pre: Option<String>,
}

impl Version {
    /// Parses `"major.minor.patch[-pre]"`. Missing segments default to 0.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (core, pre) = match text.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some((core, _)) => (core, None),
            None => (text, None),
        };
        let mut parts = core.splitn(3, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().unwrap_or("0").parse().ok()?;
        let patch = parts.next().unwrap_or("0").parse().ok()?;
        Some(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    /// Which wire dialect this server's realtime feed speaks.
    pub fn dialect(&self) -> Dialect {
        if self.major >= 8 {
            Dialect::Current
        } else {
            Dialect::Legacy
        }
    }

    /// Totally ordered key: release channel ranks above its pre-releases,
    /// and `pl` (patch-level) releases rank above `rc`, `beta`, `alpha`.
    fn sort_key(&self) -> (u32, u32, u32, u8, u64) {
        let (rank, number) = match &self.pre {
            None => (5, 0),
            Some(pre) => pre_rank(pre),
        };
        (self.major, self.minor, self.patch, rank, number)
    }
}

fn pre_rank(pre: &str) -> (u8, u64) {
    let lower = pre.to_ascii_lowercase();
    let word: String = lower
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    let digits: String = lower.chars().filter(|c| c.is_ascii_digit()).collect();
    let rank = match word.as_str() {
        "alpha" => 0,
        "beta" => 1,
        "rc" => 2,
        "pl" => 4,
        _ => 3,
    };
    (rank, digits.parse().unwrap_or(0))
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

/// Version advertised by a page body, if any.
pub fn page_version(html: &str) -> Option<Version> {
    VERSION_META
        .captures(html)
        .and_then(|caps| Version::parse(&caps[1]))
}

/// Session token carried by an authenticated page body.
pub fn session_token(html: &str) -> Option<String> {
    SESSION_META
        .captures(html)
        .or_else(|| SESSION_VAR.captures(html))
        .map(|caps| caps[1].to_string())
}

/// Whether a page body carries the authenticated session marker.
pub fn has_session_marker(html: &str) -> bool {
    session_token(html).is_some()
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Extractor generation, keyed to the server versions that changed page
/// markup in ways the client can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    V7,
    V71,
    V8,
    V874,
    V9,
}

impl Default for Generation {
    fn default() -> Self {
        Self::V874
    }
}

impl Generation {
    /// Generation matching a reported server version.
    pub fn for_version(version: &Version) -> Self {
        let key = version.sort_key();
        if key >= (9, 0, 0, 5, 0) {
            Self::V9
        } else if key >= (8, 7, 4, 4, 3) {
            Self::V874
        } else if key >= (8, 0, 0, 5, 0) {
            Self::V8
        } else if key >= (7, 1, 0, 2, 0) {
            Self::V71
        } else {
            Self::V7
        }
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Turns page bytes into the typed values the client needs. One built-in
/// implementation ([`MarkupExtractor`]) covers the mandatory markers;
/// richer, fully version-specific parsing can be plugged in from outside.
pub trait Extractor: Send + Sync {
    /// Session token from an authenticated page, if present.
    fn session(&self, html: &str) -> Option<String>;

    /// Snapshot refresh harvested from any authenticated full page.
    fn page_update(&self, html: &str) -> PageUpdate;

    /// Player identity markers.
    fn player(&self, html: &str) -> Option<Player>;

    /// Settings read off the preferences page.
    fn preferences(&self, html: &str) -> Preferences;

    /// Realtime feed endpoint advertised by the landing page.
    fn stream_endpoint(&self, html: &str) -> Option<StreamEndpoint>;
}

/// Regex-driven [`Extractor`] over the stable page markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkupExtractor {
    generation: Generation,
}

impl MarkupExtractor {
    pub fn new(generation: Generation) -> Self {
        Self { generation }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    fn planets(&self, html: &str) -> Vec<Planet> {
        let heads: Vec<(usize, i64)> = PLANET_DIV
            .captures_iter(html)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some((whole.start(), caps[1].parse().ok()?))
            })
            .collect();

        let mut planets = Vec::with_capacity(heads.len());
        for (index, (start, id)) in heads.iter().enumerate() {
            let end = heads.get(index + 1).map_or(html.len(), |(next, _)| *next);
            let section = &html[*start..end];
            let mut titles = CELESTIAL_TITLE.captures_iter(section);
            let Some(head) = titles.next() else { continue };
            let coordinate = Coordinate::new(
                parse_i64(&head[2]),
                parse_i64(&head[3]),
                parse_i64(&head[4]),
            );
            let moon = MOON_TAG.find(section).and_then(|tag| {
                let moon_id = CELESTIAL_PARAM.captures(tag.as_str())?[1].parse().ok()?;
                Some(Moon {
                    id: moon_id,
                    name: titles
                        .next()
                        .map(|title| title[1].trim().to_string())
                        .unwrap_or_default(),
                })
            });
            planets.push(Planet {
                id: *id,
                name: head[1].trim().to_string(),
                coordinate,
                moon,
            });
        }
        planets
    }

    fn vacation(&self, html: &str) -> bool {
        ADVICE_LINK.captures(html).is_some_and(|caps| {
            let href = &caps[1];
            href.contains("page=preferences")
                && href.contains("selectedTab=3")
                && href.contains("openGroup=0")
        })
    }

    fn character_class(&self, html: &str) -> Option<CharacterClass> {
        // Classes only exist from the 7.1 markup onward.
        if self.generation == Generation::V7 {
            return None;
        }
        CHARACTER_CLASS
            .captures(html)
            .map(|caps| match &caps[1] {
                "miner" => CharacterClass::Collector,
                "warrior" => CharacterClass::General,
                _ => CharacterClass::Discoverer,
            })
    }

    fn officers(&self, html: &str) -> OfficerSuite {
        let mut officers = OfficerSuite::default();
        for caps in OFFICER_ANCHOR.captures_iter(html) {
            let hired = caps[1].split_whitespace().any(|class| class == "on");
            match &caps[2] {
                "commander" => officers.commander = hired,
                "admiral" => officers.admiral = hired,
                "engineer" => officers.engineer = hired,
                "geologist" => officers.geologist = hired,
                "technocrat" => officers.technocrat = hired,
                _ => {}
            }
        }
        officers
    }

    fn chat_token(&self, html: &str) -> Option<String> {
        CHAT_TOKEN.captures(html).map(|caps| caps[1].to_string())
    }
}

impl Extractor for MarkupExtractor {
    fn session(&self, html: &str) -> Option<String> {
        session_token(html)
    }

    fn page_update(&self, html: &str) -> PageUpdate {
        PageUpdate {
            session: self.session(html),
            planets: self.planets(html),
            vacation: self.vacation(html),
            chat_token: self.chat_token(html),
            character_class: self.character_class(html),
            officers: self.officers(html),
        }
    }

    fn player(&self, html: &str) -> Option<Player> {
        let id = PLAYER_ID_META.captures(html)?[1].parse().ok()?;
        let name = PLAYER_NAME_META.captures(html)?[1].to_string();
        Some(Player { id, name })
    }

    fn preferences(&self, html: &str) -> Preferences {
        let mut prefs = Preferences::default();
        for caps in SELECT_BLOCK.captures_iter(html) {
            let Some(value) = selected_value(&caps[2]) else {
                continue;
            };
            match &caps[1] {
                "spio_anz" => prefs.spio_anz = value,
                "eventsShow" => prefs.events_show = value,
                "msgResultsPerPage" => prefs.msg_results_per_page = value,
                _ => {}
            }
        }
        prefs.show_activity_minutes = checkbox_on(html, "showActivityMinutes");
        prefs.preserve_system_on_planet_change = checkbox_on(html, "preserveSystemOnPlanetChange");
        prefs.disable_chat_bar = checkbox_on(html, "disableChatBar");
        prefs.auctioneer_notifications = checkbox_on(html, "auctioneerNotifications");
        prefs.vacation_mode = checkbox_on(html, "urlaubsModus");
        prefs
    }

    fn stream_endpoint(&self, html: &str) -> Option<StreamEndpoint> {
        StreamEndpoint::from_page(html)
    }
}

fn selected_value(select_body: &str) -> Option<i64> {
    OPTION_TAG
        .captures_iter(select_body)
        .find(|caps| caps[0].contains("selected"))
        .map(|caps| parse_i64(&caps[1]))
}

fn checkbox_on(html: &str, name: &str) -> bool {
    let marker = format!("name=\"{name}\"");
    INPUT_TAG
        .find_iter(html)
        .any(|tag| tag.as_str().contains(&marker) && tag.as_str().contains("checked"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(text: &str) -> Version {
        Version::parse(text).unwrap()
    }

    // ========================================================================
    // Version parsing and ordering
    // ========================================================================

    #[test]
    fn test_version_parse_full_and_partial() {
        assert_eq!(
            version("8.7.4-pl3"),
            Version {
                major: 8,
                minor: 7,
                patch: 4,
                pre: Some("pl3".to_string()),
            }
        );
        assert_eq!(version("9"), version("9.0.0"));
        assert!(Version::parse("not-a-version").is_none());
        assert!(Version::parse("").is_none());
    }

    #[test]
    fn test_version_ordering_is_prerelease_aware() {
        assert!(version("8.7.4") > version("8.7.4-pl3"));
        assert!(version("8.7.4-pl3") > version("8.7.4-rc2"));
        assert!(version("8.7.4-rc2") > version("8.7.4-beta1"));
        assert!(version("8.7.4-beta1") > version("8.7.4-alpha2"));
        assert!(version("8.7.5-rc1") > version("8.7.4"));
        assert!(version("7.1.0-rc0") < version("7.1.0"));
    }

    #[test]
    fn test_version_dialect_split() {
        assert_eq!(version("7.6.8").dialect(), Dialect::Legacy);
        assert_eq!(version("8.0.0").dialect(), Dialect::Current);
        assert_eq!(version("11.15.0").dialect(), Dialect::Current);
    }

    #[test]
    fn test_version_display_round_trip() {
        assert_eq!(version("8.7.4-pl3").to_string(), "8.7.4-pl3");
        assert_eq!(version("9.0.0").to_string(), "9.0.0");
    }

    #[test]
    fn test_generation_thresholds() {
        assert_eq!(Generation::for_version(&version("9.0.0")), Generation::V9);
        assert_eq!(Generation::for_version(&version("10.1.2")), Generation::V9);
        // A 9.0.0 pre-release has not reached the 9.0.0 threshold yet.
        assert_eq!(
            Generation::for_version(&version("9.0.0-rc1")),
            Generation::V874
        );
        assert_eq!(
            Generation::for_version(&version("8.7.4-pl3")),
            Generation::V874
        );
        assert_eq!(Generation::for_version(&version("8.7.4-rc2")), Generation::V8);
        assert_eq!(Generation::for_version(&version("8.0.0")), Generation::V8);
        assert_eq!(Generation::for_version(&version("7.6.8")), Generation::V71);
        assert_eq!(
            Generation::for_version(&version("7.1.0-rc0")),
            Generation::V71
        );
        assert_eq!(Generation::for_version(&version("7.0.0")), Generation::V7);
        assert_eq!(Generation::for_version(&version("6.8.1")), Generation::V7);
    }

    #[test]
    fn test_page_version_from_meta() {
        let html = r#"<head><meta name="ogame-version" content="8.7.4-pl4"/></head>"#;
        assert_eq!(page_version(html), Some(version("8.7.4-pl4")));
        assert_eq!(page_version("<head></head>"), None);
    }

    // ========================================================================
    // Markup extraction
    // ========================================================================

    const OVERVIEW: &str = r##"
<head>
<meta name="ogame-session" content="0987dcba"/>
<meta name="ogame-player-id" content="112233"/>
<meta name="ogame-player-name" content="Governor Skat"/>
</head>
<div id="characterclass" class="sprite">
  <a href="#" class="tooltip"><div class="characterclass medium miner"></div></a>
</div>
<div id="officers">
  <a href="#" class="on commander tooltipHTML" title="Commander"></a>
  <a href="#" class="admiral tooltipHTML" title="Admiral"></a>
  <a href="#" class="engineer on tooltipHTML" title="Engineer"></a>
  <a href="#" class="geologist tooltipHTML" title="Geologist"></a>
  <a href="#" class="technocrat tooltipHTML" title="Technocrat"></a>
</div>
<script>var ajaxChatToken = 'fa3e7c12';</script>
<div id="planetList">
  <div class="smallplanet" id="planet-33620229">
    <a href="?page=ingame&component=overview&cp=33620229" title="<b>Homeworld [2:39:8]</b><br/>12.800km (163/163)" class="planetlink">
      <span class="planet-name">Homeworld</span>
      <span class="planet-koords">[2:39:8]</span>
    </a>
    <a class="moonlink" href="?page=ingame&component=overview&cp=33620230" title="<b>Moon [2:39:8]</b><br>8.888km (0/1)"></a>
  </div>
  <div class="smallplanet" id="planet-33625421">
    <a href="?page=ingame&component=overview&cp=33625421" title="<b>Colony [4:116:10]</b><br/>8.250km (0/188)" class="planetlink">
      <span class="planet-name">Colony</span>
      <span class="planet-koords">[4:116:10]</span>
    </a>
  </div>
</div>
"##;

    #[test]
    fn test_session_token_meta_and_var() {
        assert_eq!(session_token(OVERVIEW).as_deref(), Some("0987dcba"));
        assert_eq!(
            session_token(r#"<script>var session = "fffa1b2c";</script>"#).as_deref(),
            Some("fffa1b2c")
        );
        assert!(session_token("<html></html>").is_none());
        assert!(has_session_marker(OVERVIEW));
    }

    #[test]
    fn test_planets_with_moon() {
        let extractor = MarkupExtractor::default();
        let planets = extractor.planets(OVERVIEW);
        assert_eq!(planets.len(), 2);

        let home = &planets[0];
        assert_eq!(home.id, 33620229);
        assert_eq!(home.name, "Homeworld");
        assert_eq!(home.coordinate, Coordinate::new(2, 39, 8));
        let moon = home.moon.as_ref().unwrap();
        assert_eq!(moon.id, 33620230);
        assert_eq!(moon.name, "Moon");

        let colony = &planets[1];
        assert_eq!(colony.id, 33625421);
        assert_eq!(colony.coordinate, Coordinate::new(4, 116, 10));
        assert!(colony.moon.is_none());
    }

    #[test]
    fn test_vacation_detected_from_advice_link() {
        let extractor = MarkupExtractor::default();
        let on_vacation = r#"<div id="advice-bar">
            <a href="https://s152-en.example.com/game/index.php?page=preferences&selectedTab=3&openGroup=0">!</a>
        </div>"#;
        assert!(extractor.vacation(on_vacation));
        assert!(!extractor.vacation(OVERVIEW));
        let other_advice = r#"<div id="advice-bar"><a href="?page=messages">!</a></div>"#;
        assert!(!extractor.vacation(other_advice));
    }

    #[test]
    fn test_character_class_by_generation() {
        let current = MarkupExtractor::new(Generation::V874);
        assert_eq!(
            current.character_class(OVERVIEW),
            Some(CharacterClass::Collector)
        );
        assert_eq!(current.character_class("<div></div>"), None);

        // The 7.0 markup has no class div to read.
        let legacy = MarkupExtractor::new(Generation::V7);
        assert_eq!(legacy.character_class(OVERVIEW), None);
    }

    #[test]
    fn test_officers_read_on_flag() {
        let extractor = MarkupExtractor::default();
        let officers = extractor.officers(OVERVIEW);
        assert!(officers.commander);
        assert!(!officers.admiral);
        assert!(officers.engineer);
        assert!(!officers.geologist);
        assert!(!officers.technocrat);
    }

    #[test]
    fn test_chat_token_from_inline_script() {
        let extractor = MarkupExtractor::default();
        assert_eq!(extractor.chat_token(OVERVIEW).as_deref(), Some("fa3e7c12"));
        assert_eq!(
            extractor
                .chat_token(r#"ajaxChatToken="00aaff";"#)
                .as_deref(),
            Some("00aaff")
        );
        assert!(extractor.chat_token("<html></html>").is_none());
    }

    #[test]
    fn test_page_update_composes_all_markers() {
        let extractor = MarkupExtractor::default();
        let update = extractor.page_update(OVERVIEW);
        assert_eq!(update.session.as_deref(), Some("0987dcba"));
        assert_eq!(update.planets.len(), 2);
        assert!(!update.vacation);
        assert_eq!(update.chat_token.as_deref(), Some("fa3e7c12"));
        assert_eq!(update.character_class, Some(CharacterClass::Collector));
        assert!(update.officers.commander);
    }

    #[test]
    fn test_player_from_meta_markers() {
        let extractor = MarkupExtractor::default();
        let player = extractor.player(OVERVIEW).unwrap();
        assert_eq!(player.id, 112233);
        assert_eq!(player.name, "Governor Skat");
        assert!(extractor.player("<html></html>").is_none());
    }

    #[test]
    fn test_preferences_selects_and_checkboxes() {
        let html = r#"
<select name="spio_anz" class="dropdown">
  <option value="1">1</option>
  <option value="3" selected="selected">3</option>
</select>
<select name="eventsShow">
  <option selected="selected" value="2">2</option>
</select>
<select name="msgResultsPerPage">
  <option value="10">10</option>
  <option value="25">25</option>
</select>
<input type="checkbox" name="showActivityMinutes" value="1" checked="checked"/>
<input type="checkbox" name="preserveSystemOnPlanetChange" value="1"/>
<input name="disableChatBar" type="checkbox" checked="checked"/>
"#;
        let prefs = MarkupExtractor::default().preferences(html);
        assert_eq!(prefs.spio_anz, 3);
        assert_eq!(prefs.events_show, 2);
        // No option selected: the field keeps its default.
        assert_eq!(prefs.msg_results_per_page, 0);
        assert!(prefs.show_activity_minutes);
        assert!(!prefs.preserve_system_on_planet_change);
        assert!(prefs.disable_chat_bar);
        assert!(!prefs.vacation_mode);
    }

    #[test]
    fn test_stream_endpoint_delegates_to_landing_page() {
        let html = r#"var nodeUrl = "https:\/\/s152-en.example.com:19603\/socket.io\/socket.io.js";"#;
        let endpoint = MarkupExtractor::default().stream_endpoint(html).unwrap();
        assert_eq!(endpoint.host, "s152-en.example.com");
        assert_eq!(endpoint.port, 19603);
    }
}
