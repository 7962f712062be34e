//! Gmail IMAP connector (XOAUTH2) over a blocking `imap` session.
//!
//! The session is owned behind an `Option` and shipped through
//! `spawn_blocking` for every operation; a panic or join failure drops the
//! session and surfaces as a transient error, which the fetcher answers
//! with a reconnect. CONDSTORE markers and `X-GM-MSGID` never appear in the
//! typed response API, so those commands go out raw and are parsed from
//! the response bytes.

use std::collections::HashMap;

use mailparse::{MailHeaderMap, ParsedMail};
use rayon::prelude::*;
use tracing::warn;

use super::response;
use super::{
    build_uid_sequence, FetchedMessage, FetchedPart, FolderStatus, MailClient, MailError,
    SelectedFolder,
};
use crate::types::{normalize_flags, now_ts, GMsgId, MessageMeta, Uid};

const IMAP_HOST: &str = "imap.gmail.com";
const IMAP_PORT: u16 = 993;

/// UID-set length cap for a single command line.
const COMMAND_CHUNK: usize = 500;

type Session = imap::Session<Box<dyn imap::ImapConnection>>;

pub struct GmailClient {
    email: String,
    sync_folders: Vec<String>,
    chunk_size: usize,
    session: Option<Session>,
}

impl GmailClient {
    pub async fn connect(
        email: &str,
        access_token: &str,
        sync_folders: Vec<String>,
        chunk_size: usize,
    ) -> Result<Self, MailError> {
        let user = email.to_string();
        let token = access_token.to_string();

        let session = tokio::task::spawn_blocking(move || -> Result<Session, MailError> {
            let client = imap::ClientBuilder::new(IMAP_HOST, IMAP_PORT)
                .connect()
                .map_err(|e| {
                    MailError::Transient(format!("connecting to {IMAP_HOST}:{IMAP_PORT}: {e}"))
                })?;
            let auth = Xoauth2 {
                user,
                access_token: token,
            };
            client
                .authenticate("XOAUTH2", &auth)
                .map_err(|(e, _client)| MailError::Transient(format!("XOAUTH2 authenticate: {e}")))
        })
        .await
        .map_err(|e| MailError::Transient(format!("imap connect task: {e}")))??;

        Ok(Self {
            email: email.to_string(),
            sync_folders,
            chunk_size,
            session: Some(session),
        })
    }

    /// Runs a blocking operation against the session on the blocking pool,
    /// returning the session afterwards. A lost session (earlier panic or
    /// join failure) reads as transient so the caller reconnects.
    async fn with_session<T, F>(&mut self, op: F) -> Result<T, MailError>
    where
        F: FnOnce(&mut Session) -> Result<T, MailError> + Send + 'static,
        T: Send + 'static,
    {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| MailError::Transient("imap session lost".into()))?;

        let (session, out) = tokio::task::spawn_blocking(move || {
            let out = op(&mut session);
            (session, out)
        })
        .await
        .map_err(|e| MailError::Transient(format!("imap task join: {e}")))?;

        self.session = Some(session);
        out
    }

    async fn run_raw(&mut self, command: String) -> Result<String, MailError> {
        let raw = self
            .with_session(move |session| {
                session
                    .run_command_and_read_response(&command)
                    .map_err(|e| MailError::Transient(format!("imap command failed: {e}")))
            })
            .await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

#[async_trait::async_trait]
impl MailClient for GmailClient {
    fn email_address(&self) -> &str {
        &self.email
    }

    fn sync_folders(&self) -> &[String] {
        &self.sync_folders
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn select_folder(&mut self, folder: &str) -> Result<SelectedFolder, MailError> {
        let raw = self
            .run_raw(format!("SELECT \"{}\" (CONDSTORE)", folder))
            .await?;
        let data = response::parse_select(&raw);

        let uid_validity = data.uid_validity.ok_or_else(|| {
            MailError::Transient(format!("SELECT {folder}: server sent no UIDVALIDITY"))
        })?;
        let highestmodseq = data.highestmodseq.ok_or_else(|| {
            MailError::Transient(format!("SELECT {folder}: server sent no HIGHESTMODSEQ"))
        })?;

        Ok(SelectedFolder {
            name: folder.to_string(),
            uid_validity,
            highestmodseq,
            exists: data.exists.unwrap_or(0),
        })
    }

    async fn folder_status(&mut self, folder: &str) -> Result<FolderStatus, MailError> {
        let raw = self
            .run_raw(format!(
                "STATUS \"{}\" (UIDVALIDITY HIGHESTMODSEQ)",
                folder
            ))
            .await?;
        let (uid_validity, highestmodseq) = response::parse_status(&raw).ok_or_else(|| {
            MailError::Transient(format!("STATUS {folder}: unparseable response"))
        })?;
        Ok(FolderStatus {
            uid_validity,
            highestmodseq,
        })
    }

    async fn all_uids(&mut self) -> Result<Vec<Uid>, MailError> {
        let raw = self.run_raw("UID SEARCH ALL".to_string()).await?;
        Ok(response::parse_search(&raw))
    }

    async fn search_changed_since(&mut self, highestmodseq: u64) -> Result<Vec<Uid>, MailError> {
        // SEARCH MODSEQ n matches modseq >= n; strictly-greater means n + 1.
        let raw = self
            .run_raw(format!(
                "UID SEARCH NOT DELETED MODSEQ {}",
                highestmodseq.saturating_add(1)
            ))
            .await?;
        Ok(response::parse_search(&raw))
    }

    async fn fetch_g_msgids(&mut self, uids: &[Uid]) -> Result<HashMap<Uid, GMsgId>, MailError> {
        let mut out = HashMap::with_capacity(uids.len());
        for chunk in uids.chunks(COMMAND_CHUNK) {
            let raw = self
                .run_raw(format!(
                    "UID FETCH {} (X-GM-MSGID)",
                    build_uid_sequence(chunk)
                ))
                .await?;
            out.extend(response::parse_g_msgid_fetch(&raw));
        }
        Ok(out)
    }

    async fn fetch_uids(&mut self, uids: &[Uid]) -> Result<Vec<FetchedMessage>, MailError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let g_msgids = self.fetch_g_msgids(uids).await?;

        let seq = build_uid_sequence(uids);
        let raw_messages: Vec<RawFetch> = self
            .with_session(move |session| {
                let fetches = session
                    .uid_fetch(&seq, "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[])")
                    .map_err(|e| MailError::Transient(format!("UID FETCH bodies: {e}")))?;

                let mut out = Vec::new();
                for fetch in fetches.iter() {
                    let Some(uid) = fetch.uid else { continue };
                    let Some(body) = fetch.body() else {
                        warn!(uid, "FETCH returned no body; skipping");
                        continue;
                    };
                    out.push(RawFetch {
                        uid,
                        body: body.to_vec(),
                        flags: fetch.flags().iter().map(flag_token).collect(),
                        internal_date: fetch.internal_date().map(|dt| dt.timestamp()),
                        size: fetch.size,
                    });
                }
                Ok(out)
            })
            .await?;

        // MIME decode is CPU-bound; parse the chunk in parallel off the
        // async runtime.
        let email = self.email.clone();
        let parsed: Vec<Result<FetchedMessage, MailError>> =
            tokio::task::spawn_blocking(move || {
                raw_messages
                    .into_par_iter()
                    .map(|raw| build_message(&email, raw, &g_msgids))
                    .collect()
            })
            .await
            .map_err(|e| MailError::Transient(format!("parse task join: {e}")))?;

        let mut out = Vec::with_capacity(parsed.len());
        for message in parsed {
            out.push(message?);
        }
        out.sort_by_key(|m| m.uid);
        Ok(out)
    }

    async fn fetch_flags(&mut self, uids: &[Uid]) -> Result<HashMap<Uid, Vec<String>>, MailError> {
        let mut out = HashMap::with_capacity(uids.len());
        for chunk in uids.chunks(COMMAND_CHUNK) {
            let raw = self
                .run_raw(format!("UID FETCH {} (FLAGS)", build_uid_sequence(chunk)))
                .await?;
            for (uid, flags) in response::parse_flags_fetch(&raw) {
                out.insert(uid, normalize_flags(flags));
            }
        }
        Ok(out)
    }
}

struct RawFetch {
    uid: Uid,
    body: Vec<u8>,
    flags: Vec<String>,
    internal_date: Option<i64>,
    size: Option<u32>,
}

fn build_message(
    email: &str,
    raw: RawFetch,
    g_msgids: &HashMap<Uid, GMsgId>,
) -> Result<FetchedMessage, MailError> {
    let g_msgid = *g_msgids.get(&raw.uid).ok_or_else(|| {
        MailError::Transient(format!("uid {} missing X-GM-MSGID", raw.uid))
    })?;

    let parsed = mailparse::parse_mail(&raw.body).map_err(|e| MailError::Encoding {
        uid: raw.uid,
        reason: e.to_string(),
    })?;

    let mut parts = Vec::new();
    let mut next_part_id = 0u32;
    collect_parts(raw.uid, &parsed, &mut next_part_id, &mut parts)?;

    let meta = MessageMeta {
        account_email: email.to_string(),
        g_msgid,
        subject: parsed.headers.get_first_value("Subject"),
        from_addr: parsed.headers.get_first_value("From"),
        to_addrs: parsed.headers.get_first_value("To"),
        cc_addrs: parsed.headers.get_first_value("Cc"),
        bcc_addrs: parsed.headers.get_first_value("Bcc"),
        internal_date: raw.internal_date,
        size_bytes: raw.size,
        created_at: now_ts(),
    };

    Ok(FetchedMessage {
        uid: raw.uid,
        g_msgid,
        flags: normalize_flags(raw.flags),
        meta,
        parts,
    })
}

fn collect_parts(
    uid: Uid,
    part: &ParsedMail<'_>,
    next_part_id: &mut u32,
    out: &mut Vec<FetchedPart>,
) -> Result<(), MailError> {
    if part.subparts.is_empty() {
        let data = part.get_body_raw().map_err(|e| MailError::Encoding {
            uid,
            reason: e.to_string(),
        })?;
        out.push(FetchedPart {
            part_id: *next_part_id,
            mime_type: part.ctype.mimetype.clone(),
            filename: part.get_content_disposition().params.get("filename").cloned(),
            data,
        });
        *next_part_id += 1;
        return Ok(());
    }

    for sub in &part.subparts {
        collect_parts(uid, sub, next_part_id, out)?;
    }
    Ok(())
}

fn flag_token(flag: &imap::types::Flag<'_>) -> String {
    use imap::types::Flag;
    match flag {
        Flag::Seen => "Seen".to_string(),
        Flag::Answered => "Answered".to_string(),
        Flag::Flagged => "Flagged".to_string(),
        Flag::Deleted => "Deleted".to_string(),
        Flag::Draft => "Draft".to_string(),
        Flag::Recent => "Recent".to_string(),
        Flag::MayCreate => "MayCreate".to_string(),
        Flag::Custom(name) => name.trim_start_matches('\\').to_string(),
        other => format!("{other:?}"),
    }
}

struct Xoauth2 {
    user: String,
    access_token: String,
}

impl imap::Authenticator for Xoauth2 {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> String {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}
