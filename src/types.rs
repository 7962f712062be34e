use chrono::Utc;

/// Gmail's per-account global message id (`X-GM-MSGID`). Stable across
/// folders and across UIDVALIDITY changes.
pub type GMsgId = u64;

/// Per-(account, folder) message id assigned by the IMAP server.
pub type Uid = u32;

#[derive(Clone, Debug)]
pub struct Account {
    pub email: String,
    pub initial_sync_done: bool,
    pub sync_folders: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The `(uid_validity, highestmodseq)` checkpoint for one folder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorValues {
    pub uid_validity: u32,
    pub highestmodseq: u64,
}

#[derive(Clone, Debug)]
pub struct FolderCursor {
    pub account_email: String,
    pub folder: String,
    pub uid_validity: u32,
    pub highestmodseq: u64,
}

impl FolderCursor {
    pub fn values(&self) -> CursorValues {
        CursorValues {
            uid_validity: self.uid_validity,
            highestmodseq: self.highestmodseq,
        }
    }
}

/// "This remote UID in this folder refers to that globally-identified
/// message." Flags live here and only here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderMembership {
    pub account_email: String,
    pub folder: String,
    pub uid: Uid,
    pub g_msgid: GMsgId,
    pub flags: Vec<String>,
}

impl FolderMembership {
    /// Link-only construction: points an existing message at another folder.
    pub fn link(account_email: &str, folder: &str, uid: Uid, g_msgid: GMsgId) -> Self {
        Self {
            account_email: account_email.to_string(),
            folder: folder.to_string(),
            uid,
            g_msgid,
            flags: Vec::new(),
        }
    }
}

/// Exactly one row per (account, g_msgid), however many folders carry the
/// message. Written once, never rewritten.
#[derive(Clone, Debug)]
pub struct MessageMeta {
    pub account_email: String,
    pub g_msgid: GMsgId,
    pub subject: Option<String>,
    pub from_addr: Option<String>,
    pub to_addrs: Option<String>,
    pub cc_addrs: Option<String>,
    pub bcc_addrs: Option<String>,
    pub internal_date: Option<i64>,
    pub size_bytes: Option<u32>,
    pub created_at: i64,
}

#[derive(Clone, Debug)]
pub struct MessagePart {
    pub account_email: String,
    pub g_msgid: GMsgId,
    pub part_id: u32,
    pub mime_type: String,
    pub filename: Option<String>,
    pub blob_ref: String,
    pub size_bytes: u32,
}

/// Flags are compared as sets; sorting at ingress makes the stored JSON
/// stable across runs.
pub fn normalize_flags(mut flags: Vec<String>) -> Vec<String> {
    flags.sort();
    flags.dedup();
    flags
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
