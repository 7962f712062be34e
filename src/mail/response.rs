//! Parsers for the raw IMAP responses the typed client API does not
//! surface: CONDSTORE data from SELECT/STATUS, SEARCH results with the
//! MODSEQ modifier, and Gmail extension FETCH attributes.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{GMsgId, Uid};

static UIDVALIDITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"UIDVALIDITY (\d+)").unwrap());
static HIGHESTMODSEQ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"HIGHESTMODSEQ (\d+)").unwrap());
static EXISTS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\* (\d+) EXISTS").unwrap());
static SEARCH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\* SEARCH((?: \d+)*)\s*(?:\(MODSEQ \d+\))?\s*$").unwrap());
static FETCH_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\* \d+ FETCH \((.*)\)\s*$").unwrap());
static UID_ATTR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bUID (\d+)").unwrap());
static G_MSGID_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bX-GM-MSGID (\d+)").unwrap());
static FLAGS_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bFLAGS \(([^)]*)\)").unwrap());

#[derive(Clone, Copy, Debug, Default)]
pub struct SelectData {
    pub uid_validity: Option<u32>,
    pub highestmodseq: Option<u64>,
    pub exists: Option<u32>,
}

pub fn parse_select(raw: &str) -> SelectData {
    SelectData {
        uid_validity: capture_u64(&UIDVALIDITY_RE, raw).map(|v| v as u32),
        highestmodseq: capture_u64(&HIGHESTMODSEQ_RE, raw),
        exists: capture_u64(&EXISTS_RE, raw).map(|v| v as u32),
    }
}

pub fn parse_status(raw: &str) -> Option<(u32, u64)> {
    let uid_validity = capture_u64(&UIDVALIDITY_RE, raw)? as u32;
    let highestmodseq = capture_u64(&HIGHESTMODSEQ_RE, raw)?;
    Some((uid_validity, highestmodseq))
}

/// Collects uids from every `* SEARCH` line. Gmail appends `(MODSEQ n)`
/// when the search criteria include MODSEQ; an empty result is a bare
/// `* SEARCH` line.
pub fn parse_search(raw: &str) -> Vec<Uid> {
    let mut uids = Vec::new();
    for caps in SEARCH_RE.captures_iter(raw) {
        for token in caps[1].split_whitespace() {
            if let Ok(uid) = token.parse::<Uid>() {
                uids.push(uid);
            }
        }
    }
    uids
}

pub fn parse_g_msgid_fetch(raw: &str) -> HashMap<Uid, GMsgId> {
    let mut out = HashMap::new();
    for caps in FETCH_LINE_RE.captures_iter(raw) {
        let attrs = &caps[1];
        let uid = UID_ATTR_RE
            .captures(attrs)
            .and_then(|c| c[1].parse::<Uid>().ok());
        let g_msgid = G_MSGID_ATTR_RE
            .captures(attrs)
            .and_then(|c| c[1].parse::<GMsgId>().ok());
        if let (Some(uid), Some(g_msgid)) = (uid, g_msgid) {
            out.insert(uid, g_msgid);
        }
    }
    out
}

pub fn parse_flags_fetch(raw: &str) -> HashMap<Uid, Vec<String>> {
    let mut out = HashMap::new();
    for caps in FETCH_LINE_RE.captures_iter(raw) {
        let attrs = &caps[1];
        let Some(uid) = UID_ATTR_RE
            .captures(attrs)
            .and_then(|c| c[1].parse::<Uid>().ok())
        else {
            continue;
        };
        let flags = FLAGS_ATTR_RE
            .captures(attrs)
            .map(|c| {
                c[1].split_whitespace()
                    .map(|f| f.trim_start_matches('\\').to_string())
                    .collect()
            })
            .unwrap_or_default();
        out.insert(uid, flags);
    }
    out
}

fn capture_u64(re: &Regex, raw: &str) -> Option<u64> {
    re.captures(raw).and_then(|c| c[1].parse::<u64>().ok())
}
