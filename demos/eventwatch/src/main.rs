use astrolink::prelude::*;
use astrolink::Lobby;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Everything the watcher needs, read from `ASTROLINK_*` variables.
#[derive(Debug)]
struct Settings {
    universe: String,
    language: String,
    email: String,
    password: String,
    player_id: Option<i64>,
    lobby: Lobby,
    poll_interval: Duration,
}

impl Settings {
    /// Variables are read through `get` so tests can hand in a map
    /// instead of touching the process environment.
    fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let required = |key: &str| {
            get(key)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| format!("{key} is not set"))
        };
        let universe = required("ASTROLINK_UNIVERSE")?;
        let language = required("ASTROLINK_LANGUAGE")?;
        let email = required("ASTROLINK_EMAIL")?;
        let password = required("ASTROLINK_PASSWORD")?;

        let player_id = match get("ASTROLINK_PLAYER_ID") {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| format!("ASTROLINK_PLAYER_ID must be a number, got {raw:?}"))?,
            ),
            None => None,
        };
        let lobby = match get("ASTROLINK_LOBBY") {
            Some(raw) => parse_lobby(&raw)
                .ok_or_else(|| format!("ASTROLINK_LOBBY must be normal or pioneers, got {raw:?}"))?,
            None => Lobby::Normal,
        };
        let poll_interval = match get("ASTROLINK_POLL_SECS") {
            Some(raw) => parse_interval(&raw).ok_or_else(|| {
                format!("ASTROLINK_POLL_SECS must be a positive number of seconds, got {raw:?}")
            })?,
            None => Duration::from_secs(60),
        };

        Ok(Settings {
            universe,
            language,
            email,
            password,
            player_id,
            lobby,
            poll_interval,
        })
    }
}

fn parse_lobby(raw: &str) -> Option<Lobby> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "normal" => Some(Lobby::Normal),
        "pioneers" => Some(Lobby::Pioneers),
        _ => None,
    }
}

fn parse_interval(raw: &str) -> Option<Duration> {
    let secs: u64 = raw.trim().parse().ok()?;
    if secs == 0 {
        return None;
    }
    Some(Duration::from_secs(secs))
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    astrolink::init_tracing();

    let settings = Settings::from_vars(|key| std::env::var(key).ok())?;

    let mut config = BotConfig::new(settings.universe, settings.language);
    config.player_id = settings.player_id.unwrap_or(0);
    config.lobby = settings.lobby;
    let credentials = Credentials::new(settings.email, settings.password);
    let bot = Bot::builder(config, credentials).build()?;

    bot.on_chat_message(|msg| {
        info!(from = %msg.sender_name, "{}", msg.text);
    });
    bot.on_auctioneer_event(|event| match event {
        AuctioneerEvent::NewBid { sum, player, .. } => {
            info!(bidder = %player.name, sum, "auction outbid");
        }
        AuctioneerEvent::Finished { sum, player, .. } => {
            info!(winner = %player.name, sum, "auction closed");
        }
        other => debug!(?other, "auctioneer"),
    });

    bot.login().await?;
    if let Some(player) = bot.player() {
        info!(player = %player.name, server = %bot.server_url(), "session established");
    }

    // Background poll at low priority so it never starves anything the
    // operator runs by hand against the same client.
    let mut poll = tokio::time::interval(settings.poll_interval);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                match bot.with_priority(Priority::Low).fetch_eventbox().await {
                    Ok(counts) if counts.hostile > 0 => {
                        warn!(hostile = counts.hostile, "hostile fleet movement");
                    }
                    Ok(counts) => {
                        debug!(neutral = counts.neutral, friendly = counts.friendly, "quiet skies");
                    }
                    Err(err) => error!(error = %err, "eventbox poll failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    bot.logout().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const BASE: &[(&str, &str)] = &[
        ("ASTROLINK_UNIVERSE", "Andromeda"),
        ("ASTROLINK_LANGUAGE", "en"),
        ("ASTROLINK_EMAIL", "pilot@example.com"),
        ("ASTROLINK_PASSWORD", "hunter2"),
    ];

    fn with_extra(extra: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = BASE
            .iter()
            .chain(extra)
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_variable_is_named_in_the_error() {
        let err = Settings::from_vars(|_| None).unwrap_err();
        assert!(err.contains("ASTROLINK_UNIVERSE"));

        let err = Settings::from_vars(with_extra(&[("ASTROLINK_PASSWORD", "")])).unwrap_err();
        assert!(err.contains("ASTROLINK_PASSWORD"));
    }

    #[test]
    fn test_defaults_apply_when_optionals_are_absent() {
        let settings = Settings::from_vars(with_extra(&[])).unwrap();
        assert_eq!(settings.player_id, None);
        assert_eq!(settings.lobby, Lobby::Normal);
        assert_eq!(settings.poll_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_optionals_are_honored() {
        let settings = Settings::from_vars(with_extra(&[
            ("ASTROLINK_PLAYER_ID", "112233"),
            ("ASTROLINK_LOBBY", "Pioneers"),
            ("ASTROLINK_POLL_SECS", "15"),
        ]))
        .unwrap();
        assert_eq!(settings.player_id, Some(112233));
        assert_eq!(settings.lobby, Lobby::Pioneers);
        assert_eq!(settings.poll_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_bad_player_id_is_rejected() {
        let err =
            Settings::from_vars(with_extra(&[("ASTROLINK_PLAYER_ID", "governor")])).unwrap_err();
        assert!(err.contains("ASTROLINK_PLAYER_ID"));
    }

    #[test]
    fn test_parse_lobby_spellings() {
        assert_eq!(parse_lobby("normal"), Some(Lobby::Normal));
        assert_eq!(parse_lobby(" PIONEERS "), Some(Lobby::Pioneers));
        assert_eq!(parse_lobby("community"), None);
    }

    #[test]
    fn test_parse_interval_rejects_zero_and_junk() {
        assert_eq!(parse_interval("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_interval("0"), None);
        assert_eq!(parse_interval("soon"), None);
    }
}
