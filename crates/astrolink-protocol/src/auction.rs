//! Auctioneer event decoding.
//!
//! The auctioneer namespace pushes loosely-typed JSON: event arguments mix
//! numbers, numeric strings, and markup fragments the official client
//! renders directly. Decoding is therefore best-effort: recognized names
//! produce typed events, anything else is passed through verbatim as
//! [`AuctioneerEvent::Raw`] so observers still see it.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));
static BOLD_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<b[^>]*>([^<]*)</b>").expect("valid regex"));
static SPAN_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<span[^>]*>([^<]*)</span>").expect("valid regex"));

/// The player attached to a bid or an auction result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuctionPlayer {
    pub id: i64,
    pub name: String,
    pub link: String,
}

/// One event from the auctioneer namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuctioneerEvent {
    /// Someone outbid the current price.
    NewBid {
        auction_id: i64,
        sum: i64,
        price: i64,
        bids: i64,
        player: AuctionPlayer,
    },
    /// Periodic "approx. Nm remaining" announcement, converted to seconds.
    TimeRemaining { approx: i64 },
    /// Countdown to the next auction, in seconds.
    NextAuction { secs: i64 },
    /// A new auction opened; `approx` is its announced duration in seconds.
    NewAuction { auction_id: i64, approx: i64 },
    /// The running auction closed.
    Finished {
        sum: i64,
        bids: i64,
        player: AuctionPlayer,
    },
    /// An event the decoder does not recognize, delivered verbatim.
    Raw(String),
}

impl AuctioneerEvent {
    /// Decodes a named event with its first argument.
    ///
    /// `raw` is the undecoded payload used for the fallback variant.
    pub fn from_named(name: &str, arg: Option<&Value>, raw: &str) -> AuctioneerEvent {
        match (name, arg) {
            ("new bid", Some(Value::Object(map))) => AuctioneerEvent::NewBid {
                auction_id: num_from_str(map.get("auctionId")),
                sum: num(map.get("sum")),
                price: num(map.get("price")),
                bids: num(map.get("bids")),
                player: player(map.get("player")),
            },
            ("timeLeft", Some(Value::String(text))) if text.contains("color:") => {
                AuctioneerEvent::TimeRemaining {
                    approx: digits_in(&BOLD_TEXT, text) * 60,
                }
            }
            ("timeLeft", Some(Value::String(text))) if text.contains("nextAuction") => {
                AuctioneerEvent::NextAuction {
                    secs: digits_in(&SPAN_TEXT, text),
                }
            }
            ("new auction", Some(Value::Object(map))) => AuctioneerEvent::NewAuction {
                auction_id: num(map.get("auctionId")),
                approx: map
                    .get("info")
                    .and_then(Value::as_str)
                    .map(|info| digits_in(&BOLD_TEXT, info) * 60)
                    .unwrap_or(0),
            },
            ("auction finished", Some(Value::Object(map))) => AuctioneerEvent::Finished {
                sum: num(map.get("sum")),
                bids: num(map.get("bids")),
                player: player(map.get("player")),
            },
            _ => AuctioneerEvent::Raw(raw.to_string()),
        }
    }
}

/// Numeric field that arrives as a JSON number.
fn num(v: Option<&Value>) -> i64 {
    match v {
        Some(value) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        None => 0,
    }
}

/// Numeric field that arrives as a numeric *string* (`"auctionId":"42894"`).
fn num_from_str(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn text(v: Option<&Value>) -> String {
    v.and_then(Value::as_str).unwrap_or_default().to_string()
}

fn player(v: Option<&Value>) -> AuctionPlayer {
    match v {
        Some(Value::Object(map)) => AuctionPlayer {
            id: num(map.get("id")),
            name: text(map.get("name")),
            link: text(map.get("link")),
        },
        _ => AuctionPlayer::default(),
    }
}

/// First run of digits inside the elements captured by `element`, with the
/// captures concatenated in document order. Returns 0 when there are none.
fn digits_in(element: &Regex, html: &str) -> i64 {
    let joined: String = element
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .collect();
    DIGITS
        .find(&joined)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}
