//! Account/session management: hands the engine an authenticated
//! `MailClient` for an email address. Reconnect-after-failure in the
//! fetcher goes through the same `connect` path.

use anyhow::Result;
use async_trait::async_trait;
use oauth2::Scope;
use tracing::info;

use crate::config::AppDefaults;
use crate::mail::{GmailClient, MailClient, MailError};
use crate::oauth::{
    authorize_interactive, authorize_with_scopes, fetch_user_email, store_refresh_token,
};
use crate::storage::Store;
use crate::types::{now_ts, Account};

#[async_trait]
pub trait Accounts: Send + Sync {
    type Client: MailClient;

    /// Opens a fresh authenticated session for the account. The previous
    /// session, if any, is abandoned; the new client must re-select its
    /// folder before use.
    async fn connect(&self, email: &str) -> Result<Self::Client, MailError>;
}

pub struct GmailAccounts {
    defaults: AppDefaults,
}

impl GmailAccounts {
    pub fn new(defaults: AppDefaults) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl Accounts for GmailAccounts {
    type Client = GmailClient;

    async fn connect(&self, email: &str) -> Result<GmailClient, MailError> {
        let scopes = vec![Scope::new("https://mail.google.com/".into())];
        let token = authorize_with_scopes(&scopes, email)
            .await
            .map_err(|e| MailError::Transient(format!("obtaining access token: {e}")))?;

        GmailClient::connect(
            email,
            &token.access_token,
            self.defaults.sync_folders.clone(),
            self.defaults.chunk_size,
        )
        .await
    }
}

/// Runs the OAuth consent flow, resolves the account's email address, and
/// persists the account row. Always interactive: a stored refresh token
/// belongs to an already-onboarded account, and reusing one here would
/// silently re-add that account instead of the one the user consents as.
pub async fn onboard_account(store: &Store, defaults: &AppDefaults) -> Result<Account> {
    let scopes = vec![
        Scope::new("https://mail.google.com/".into()),
        Scope::new("https://www.googleapis.com/auth/userinfo.email".into()),
    ];
    let token = authorize_interactive(&scopes).await?;
    let email = fetch_user_email(&token.access_token).await?;
    if let Some(refresh) = &token.refresh_token {
        store_refresh_token(&email, refresh)?;
    }

    let now = now_ts();
    let account = Account {
        email,
        initial_sync_done: false,
        sync_folders: defaults.sync_folders.clone(),
        created_at: now,
        updated_at: now,
    };
    store.upsert_account(&account).await?;
    info!(account = %account.email, "Onboarded account via OAuth");
    Ok(account)
}
