//! The mail-side boundary of the sync engine.
//!
//! `MailClient` is the surface the engine consumes; `GmailClient` is the
//! production implementation. Everything the engine needs from the server
//! goes through this trait, which is what makes the engine testable against
//! a scripted client.

pub mod imap;
pub mod response;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{GMsgId, MessageMeta, Uid};

pub use self::imap::GmailClient;

#[derive(Error, Debug)]
pub enum MailError {
    /// MIME decode failure. Fatal for the enclosing chunk; never retried.
    #[error("encoding failure for uid {uid}: {reason}")]
    Encoding { uid: Uid, reason: String },
    /// Transport or protocol failure. Eligible for one reconnect-and-retry.
    #[error("transient mail failure: {0}")]
    Transient(String),
}

impl MailError {
    pub fn is_encoding(&self) -> bool {
        matches!(self, MailError::Encoding { .. })
    }
}

/// Ambient state established by a successful SELECT.
#[derive(Clone, Debug)]
pub struct SelectedFolder {
    pub name: String,
    pub uid_validity: u32,
    pub highestmodseq: u64,
    pub exists: u32,
}

/// STATUS result; obtained without selecting the folder.
#[derive(Clone, Copy, Debug)]
pub struct FolderStatus {
    pub uid_validity: u32,
    pub highestmodseq: u64,
}

#[derive(Clone, Debug)]
pub struct FetchedPart {
    pub part_id: u32,
    pub mime_type: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

/// One fully fetched message: meta, decoded parts, and the membership data
/// (uid + flags) for the folder it was fetched from. Bundling them per uid
/// keeps the three persisted lists consistent by construction.
#[derive(Clone, Debug)]
pub struct FetchedMessage {
    pub uid: Uid,
    pub g_msgid: GMsgId,
    pub flags: Vec<String>,
    pub meta: MessageMeta,
    pub parts: Vec<FetchedPart>,
}

#[async_trait]
pub trait MailClient: Send {
    fn email_address(&self) -> &str;

    /// Folder sync priority order.
    fn sync_folders(&self) -> &[String];

    /// Tuning parameter for body fetches; flags-only fetches use a larger
    /// multiple of this.
    fn chunk_size(&self) -> usize;

    async fn select_folder(&mut self, folder: &str) -> Result<SelectedFolder, MailError>;

    async fn folder_status(&mut self, folder: &str) -> Result<FolderStatus, MailError>;

    /// All UIDs in the selected folder.
    async fn all_uids(&mut self) -> Result<Vec<Uid>, MailError>;

    /// UIDs in the selected folder with `MODSEQ` strictly greater than the
    /// given value, excluding messages flagged deleted.
    async fn search_changed_since(&mut self, highestmodseq: u64) -> Result<Vec<Uid>, MailError>;

    async fn fetch_g_msgids(&mut self, uids: &[Uid]) -> Result<HashMap<Uid, GMsgId>, MailError>;

    /// Full body fetch for at most one chunk of uids.
    async fn fetch_uids(&mut self, uids: &[Uid]) -> Result<Vec<FetchedMessage>, MailError>;

    async fn fetch_flags(&mut self, uids: &[Uid]) -> Result<HashMap<Uid, Vec<String>>, MailError>;
}

/// Comma-separated UID set for FETCH/SEARCH commands.
pub(crate) fn build_uid_sequence(uids: &[Uid]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
