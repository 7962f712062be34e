//! Google OAuth for XOAUTH2 IMAP access: PKCE consent flow over a loopback
//! redirect, refresh tokens kept in the OS keyring, silent refresh on
//! subsequent runs.

use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use std::env;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SERVICE_NAME: &str = "spool-google-oauth";

#[derive(Clone, Debug)]
pub struct TokenBundle {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: String,
}

/// Returns a fresh access token for a known account, refreshing silently
/// when its stored refresh token works and falling back to the interactive
/// consent flow when it does not.
pub async fn authorize_with_scopes(scopes: &[Scope], token_key: &str) -> AppResult<TokenBundle> {
    let creds = load_credentials()?;
    let token_store = TokenStore::for_account(token_key);

    if let Some(refresh) = token_store.load()? {
        let client = build_client(&creds, "http://127.0.0.1:8000")?;
        if let Some(bundle) = try_refresh(&client, refresh).await? {
            return Ok(bundle);
        }
        warn!(account = %token_key, "Stored refresh token failed; re-authenticating");
        token_store.delete();
    }

    let bundle = run_consent_flow(&creds, scopes).await?;
    if let Some(refresh) = &bundle.refresh_token {
        token_store.save(refresh)?;
    }
    Ok(bundle)
}

/// Consent flow with no stored-token shortcut and no persistence. Used for
/// onboarding, where the account identity is unknown until the userinfo
/// lookup afterwards; the caller keys the refresh token by the real email
/// via `store_refresh_token` once it is known.
pub async fn authorize_interactive(scopes: &[Scope]) -> AppResult<TokenBundle> {
    let creds = load_credentials()?;
    run_consent_flow(&creds, scopes).await
}

async fn run_consent_flow(creds: &InstalledCreds, scopes: &[Scope]) -> AppResult<TokenBundle> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| AppError::Unexpected(format!("failed to bind loopback port: {e}")))?;
    let local_port = listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| AppError::Unexpected(format!("failed to read local addr: {e}")))?;

    let redirect = format!("http://127.0.0.1:{local_port}");
    let client = build_client(creds, &redirect)?;

    let (auth_url, verifier, csrf) = build_auth_url(&client, scopes);
    info!(redirect = %redirect, "Opening browser for Google OAuth consent");
    open_in_browser(&auth_url);

    let code = listen_for_code(listener).await?;
    if code.state != *csrf.secret() {
        return Err(AppError::AuthExpired);
    }

    let token_res = client
        .exchange_code(AuthorizationCode::new(code.code))
        .set_pkce_verifier(verifier)
        .request_async(async_http_client)
        .await
        .map_err(|e| AppError::Network(format!("token exchange failed: {e}")))?;

    Ok(TokenBundle {
        access_token: token_res.access_token().secret().to_string(),
        expires_at: token_res
            .expires_in()
            .map(|d| Utc::now() + Duration::from_std(d).unwrap_or_else(|_| Duration::seconds(0))),
        refresh_token: token_res.refresh_token().map(|r| r.secret().to_string()),
    })
}

/// Re-keys a refresh token once the account's email address is known (the
/// consent flow runs before we can ask the userinfo endpoint who consented).
pub fn store_refresh_token(account: &str, refresh: &str) -> AppResult<()> {
    TokenStore::for_account(account).save(refresh)
}

pub async fn fetch_user_email(access_token: &str) -> AppResult<String> {
    let client = reqwest::Client::new();
    let res = client
        .get("https://www.googleapis.com/oauth2/v2/userinfo")
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| AppError::Network(format!("userinfo request failed: {e}")))?;
    if !res.status().is_success() {
        return Err(AppError::Network(format!(
            "userinfo failed with status {}",
            res.status()
        )));
    }
    let parsed: UserInfo = res
        .json()
        .await
        .map_err(|e| AppError::Unexpected(format!("parse userinfo: {e}")))?;
    Ok(parsed.email)
}

struct InstalledCreds {
    client_id: String,
    client_secret: String,
}

fn load_credentials() -> AppResult<InstalledCreds> {
    let client_id = env::var("GOOGLE_CLIENT_ID")
        .map_err(|_| AppError::Config("GOOGLE_CLIENT_ID missing".into()))?;
    let client_secret = env::var("GOOGLE_CLIENT_SECRET")
        .map_err(|_| AppError::Config("GOOGLE_CLIENT_SECRET missing".into()))?;
    Ok(InstalledCreds {
        client_id,
        client_secret,
    })
}

fn build_client(creds: &InstalledCreds, redirect: &str) -> AppResult<BasicClient> {
    let client = BasicClient::new(
        ClientId::new(creds.client_id.clone()),
        Some(ClientSecret::new(creds.client_secret.clone())),
        AuthUrl::new(AUTH_URL.to_string())
            .map_err(|e| AppError::Config(format!("invalid auth url: {e}")))?,
        Some(
            TokenUrl::new(TOKEN_URL.to_string())
                .map_err(|e| AppError::Config(format!("invalid token url: {e}")))?,
        ),
    )
    .set_redirect_uri(
        RedirectUrl::new(redirect.to_string())
            .map_err(|e| AppError::Config(format!("invalid redirect uri {redirect}: {e}")))?,
    )
    .set_auth_type(oauth2::AuthType::RequestBody);

    Ok(client)
}

fn build_auth_url(
    client: &BasicClient,
    scopes: &[Scope],
) -> (String, PkceCodeVerifier, CsrfToken) {
    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    let mut req = client
        .authorize_url(CsrfToken::new_random)
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .set_pkce_challenge(challenge);
    for scope in scopes {
        req = req.add_scope(scope.clone());
    }
    let (url, csrf) = req.url();
    (url.to_string(), verifier, csrf)
}

async fn try_refresh(client: &BasicClient, refresh_token: String) -> AppResult<Option<TokenBundle>> {
    let refresh = RefreshToken::new(refresh_token);
    match client
        .exchange_refresh_token(&refresh)
        .request_async(async_http_client)
        .await
    {
        Ok(token_res) => Ok(Some(TokenBundle {
            access_token: token_res.access_token().secret().to_string(),
            expires_at: token_res.expires_in().map(|d| {
                Utc::now() + Duration::from_std(d).unwrap_or_else(|_| Duration::seconds(0))
            }),
            refresh_token: None,
        })),
        Err(err) => {
            warn!("Refresh token invalid or expired: {err}");
            Ok(None)
        }
    }
}

struct CodeResponse {
    code: String,
    state: String,
}

async fn listen_for_code(listener: TcpListener) -> AppResult<CodeResponse> {
    let (mut stream, _) = listener
        .accept()
        .await
        .map_err(|e| AppError::Unexpected(format!("redirect accept failed: {e}")))?;

    let mut buf = [0u8; 4096];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| AppError::Unexpected(format!("reading auth callback failed: {e}")))?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let first_line = req.lines().next().unwrap_or("");
    let path = first_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| AppError::Unexpected("invalid HTTP request".into()))?;
    let full_url = format!("http://localhost{path}");
    let parsed = url::Url::parse(&full_url)
        .map_err(|e| AppError::Unexpected(format!("failed to parse callback url: {e}")))?;

    let code = parsed
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.to_string())
        .ok_or_else(|| AppError::Unexpected("callback missing code parameter".into()))?;
    let state = parsed
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.to_string())
        .unwrap_or_default();

    let response =
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nAuth complete. You can close this tab.";
    let _ = stream.write_all(response.as_bytes()).await;
    Ok(CodeResponse { code, state })
}

fn open_in_browser(url: &str) {
    let attempt = if cfg!(target_os = "macos") {
        std::process::Command::new("open").arg(url).status()
    } else if cfg!(target_os = "windows") {
        std::process::Command::new("rundll32.exe")
            .args(["url.dll,FileProtocolHandler", url])
            .status()
    } else {
        std::process::Command::new("xdg-open").arg(url).status()
    };
    if let Err(e) = attempt {
        warn!("Could not auto-open browser: {e}. Open this URL manually:\n{url}");
    }
}

struct TokenStore {
    account_id: String,
}

impl TokenStore {
    fn for_account(key: &str) -> Self {
        Self {
            account_id: key.to_string(),
        }
    }

    fn load(&self) -> AppResult<Option<String>> {
        let entry = match keyring::Entry::new(SERVICE_NAME, &self.account_id) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Keyring unavailable: {e}");
                return Ok(None);
            }
        };
        match entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => {
                warn!("Keyring read failed: {e}");
                Ok(None)
            }
        }
    }

    fn save(&self, refresh: &str) -> AppResult<()> {
        let entry = keyring::Entry::new(SERVICE_NAME, &self.account_id)
            .map_err(|e| AppError::Unexpected(format!("keyring entry error: {e}")))?;
        entry
            .set_password(refresh)
            .map_err(|e| AppError::Unexpected(format!("keyring write: {e}")))
    }

    fn delete(&self) {
        if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, &self.account_id) {
            let _ = entry.delete_password();
        }
    }
}
