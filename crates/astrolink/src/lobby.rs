//! Lobby authentication: the account-level service fronting the game
//! servers.
//!
//! The flow is: create a session against the lobby (captcha / OTP
//! challenges happen here), list the user's accounts and the public
//! server roster, join them to pick the account, then ask for a one-shot
//! login link into the chosen game server. Everything below is plain
//! request/response; the caller owns ordering and retries.

use std::sync::{Arc, LazyLock};

use astrolink_session::{Account, Credentials, Lobby, SessionError};
use futures_util::future::BoxFuture;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::AstrolinkError;

/// Cookie the lobby issues for an authenticated session. Persisting the
/// jar and replaying this cookie skips the password exchange entirely.
pub const GF_TOKEN_COOKIE: &str = "gf-token-production";

/// Response header carrying `<challenge id>;<challenge url>` on a 409.
pub const CHALLENGE_HEADER: &str = "gf-challenge-id";

const SESSIONS_URL: &str = "https://gameforge.com/api/v1/auth/thin/sessions";
const CHALLENGE_BASE: &str = "https://image-drop-challenge.gameforge.com/challenge";

static GAME_ENVIRONMENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""gameEnvironmentId":"([^"]+)""#).expect("valid regex"));
static PLATFORM_GAME_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""platformGameId":"([^"]+)""#).expect("valid regex"));

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Ids the session POST requires, scraped from the lobby's configuration
/// script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyConfiguration {
    pub game_environment_id: String,
    pub platform_game_id: String,
}

/// An authenticated lobby session.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginSession {
    pub token: String,
    pub platform_user_id: String,
    pub is_platform_login: bool,
    pub is_game_account_created: bool,
}

/// Solves the lobby's image-drop challenge: given the question strip and
/// the icon strip (both PNG bytes), return the zero-based icon index.
pub trait CaptchaSolver: Send + Sync {
    fn solve(
        &self,
        question: Vec<u8>,
        icons: Vec<u8>,
    ) -> BoxFuture<'static, Result<i64, AstrolinkError>>;
}

/// Produces the current one-time password for an OTP secret. Codes are
/// time-based, so the hook runs at send time, once per login attempt.
pub type OtpGenerator = Arc<dyn Fn(&str) -> String + Send + Sync>;

// ---------------------------------------------------------------------------
// Session creation
// ---------------------------------------------------------------------------

/// Fetches the two ids the session POST must echo back.
pub async fn fetch_configuration(
    client: &Client,
    lobby: Lobby,
) -> Result<LobbyConfiguration, AstrolinkError> {
    let url = format!("{}/config/configuration.js", lobby.base_url());
    let body = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let game_environment_id = GAME_ENVIRONMENT_ID
        .captures(&body)
        .ok_or(astrolink_protocol::ProtocolError::Handshake(
            "gameEnvironmentId",
        ))?[1]
        .to_string();
    let platform_game_id = PLATFORM_GAME_ID
        .captures(&body)
        .ok_or(astrolink_protocol::ProtocolError::Handshake("platformGameId"))?[1]
        .to_string();
    Ok(LobbyConfiguration {
        game_environment_id,
        platform_game_id,
    })
}

/// One session POST. A 409 with a challenge header maps to
/// [`SessionError::CaptchaRequired`]; a 403 maps to the matching OTP or
/// credential error.
pub async fn create_session(
    client: &Client,
    lobby: Lobby,
    credentials: &Credentials,
    otp: Option<&OtpGenerator>,
    challenge: Option<&str>,
) -> Result<LoginSession, AstrolinkError> {
    let config = fetch_configuration(client, lobby).await?;
    let payload = serde_json::json!({
        "autoGameAccountCreation": false,
        "gameEnvironmentId": config.game_environment_id,
        "platformGameId": config.platform_game_id,
        "gfLang": "en",
        "identity": credentials.username,
        "locale": "en_GB",
        "password": credentials.password,
    });

    let mut request = client.post(SESSIONS_URL).json(&payload);
    if let Some(challenge_id) = challenge {
        request = request.header(CHALLENGE_HEADER, challenge_id);
    }
    if !credentials.otp_secret.is_empty() {
        match otp {
            Some(generate) => {
                request = request
                    .header("tnt-2fa-code", generate(&credentials.otp_secret))
                    .header("tnt-installation-id", "");
            }
            None => warn!("otp secret configured but no generator installed"),
        }
    }

    let response = request.send().await?;
    if response.status() == StatusCode::CONFLICT {
        if let Some(header) = response
            .headers()
            .get(CHALLENGE_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            return Err(SessionError::CaptchaRequired(challenge_id(header)).into());
        }
    }
    if response.status() == StatusCode::FORBIDDEN {
        let body = response.text().await.unwrap_or_default();
        if body.contains("OTP_REQUIRED") {
            return Err(SessionError::OtpRequired.into());
        }
        if body.contains("OTP_INVALID") {
            return Err(SessionError::OtpInvalid.into());
        }
        return Err(SessionError::BadCredentials.into());
    }
    Ok(response.error_for_status()?.json().await?)
}

/// What [`establish_session`] does with one failed session attempt.
#[derive(Debug, PartialEq, Eq)]
enum ChallengeAction {
    /// Solve this challenge and retry the login.
    Solve(String),
    /// Surface the error to the caller as-is.
    GiveUp,
}

/// One solve per establishment: a captcha is retryable only the first
/// time, and only when a solver is installed. A second challenge in a
/// row means the answer did not take.
fn classify_challenge(
    err: &AstrolinkError,
    solved_once: bool,
    has_solver: bool,
) -> ChallengeAction {
    match err {
        AstrolinkError::Session(SessionError::CaptchaRequired(id))
            if !solved_once && has_solver =>
        {
            ChallengeAction::Solve(id.clone())
        }
        _ => ChallengeAction::GiveUp,
    }
}

/// Creates a lobby session, transparently solving one captcha challenge
/// when a solver is installed. A second challenge in a row, or a
/// challenge with no solver, surfaces as [`SessionError::CaptchaRequired`].
pub async fn establish_session(
    client: &Client,
    lobby: Lobby,
    credentials: &Credentials,
    otp: Option<&OtpGenerator>,
    solver: Option<&Arc<dyn CaptchaSolver>>,
) -> Result<LoginSession, AstrolinkError> {
    let mut challenge: Option<String> = None;
    let mut solved_once = false;
    loop {
        match create_session(client, lobby, credentials, otp, challenge.as_deref()).await {
            Ok(session) => return Ok(session),
            Err(err) => match classify_challenge(&err, solved_once, solver.is_some()) {
                ChallengeAction::GiveUp => return Err(err),
                ChallengeAction::Solve(id) => {
                    // Solve is only handed out when a solver is installed.
                    let Some(solver) = solver else {
                        return Err(err);
                    };
                    solved_once = true;
                    warn!(challenge = %id, "lobby login challenged with a captcha");
                    let (question, icons) = start_captcha_challenge(client, &id).await?;
                    let answer = solver.solve(question, icons).await?;
                    submit_captcha_answer(client, &id, answer).await?;
                    debug!(challenge = %id, answer, "captcha answer accepted, retrying login");
                    challenge = Some(id);
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Captcha challenge
// ---------------------------------------------------------------------------

/// Initializes a challenge and downloads its question and icon strips.
pub async fn start_captcha_challenge(
    client: &Client,
    challenge_id: &str,
) -> Result<(Vec<u8>, Vec<u8>), AstrolinkError> {
    let base = format!("{CHALLENGE_BASE}/{challenge_id}/en-GB");
    client.get(&base).send().await?.error_for_status()?;
    let question = client
        .get(format!("{base}/text"))
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?
        .to_vec();
    let icons = client
        .get(format!("{base}/drag-icons"))
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?
        .to_vec();
    Ok((question, icons))
}

/// Submits an answer. Anything but a `solved` echo keeps the challenge
/// open, reported as [`SessionError::CaptchaRequired`].
pub async fn submit_captcha_answer(
    client: &Client,
    challenge_id: &str,
    answer: i64,
) -> Result<(), AstrolinkError> {
    let url = format!("{CHALLENGE_BASE}/{challenge_id}/en-GB");
    let state: serde_json::Value = client
        .post(&url)
        .json(&serde_json::json!({ "answer": answer }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if state.get("status").and_then(|status| status.as_str()) != Some("solved") {
        return Err(SessionError::CaptchaRequired(challenge_id.to_string()).into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Account and server listings
// ---------------------------------------------------------------------------

/// Accounts owned by the authenticated user.
pub async fn fetch_accounts(
    client: &Client,
    lobby: Lobby,
    token: &str,
) -> Result<Vec<Account>, AstrolinkError> {
    let url = format!("{}/api/users/me/accounts", lobby.base_url());
    Ok(client
        .get(&url)
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?)
}

/// Public roster of game servers.
pub async fn fetch_servers(
    client: &Client,
    lobby: Lobby,
) -> Result<Vec<astrolink_session::Server>, AstrolinkError> {
    let url = format!("{}/api/servers", lobby.base_url());
    Ok(client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?)
}

/// One-shot login URL into the account's game server.
pub async fn fetch_login_link(
    client: &Client,
    lobby: Lobby,
    account: &Account,
    token: &str,
) -> Result<String, AstrolinkError> {
    #[derive(Deserialize)]
    struct LoginLink {
        url: String,
    }
    let url = format!(
        "{}/api/users/me/loginLink?id={}&server[language]={}&server[number]={}&clickedButton=account_list",
        lobby.base_url(),
        account.id,
        account.server.language,
        account.server.number,
    );
    let link: LoginLink = client
        .get(&url)
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(link.url)
}

fn challenge_id(header: &str) -> String {
    header.split(';').next().unwrap_or(header).to_string()
}
