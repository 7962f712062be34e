use std::collections::{HashMap, HashSet};

use crate::types::{GMsgId, Uid};

/// Bandwidth plan for a set of unknown uids: messages whose g_msgid is
/// already stored for this account only get a membership row; the rest are
/// downloaded in full.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DownloadPlan {
    pub full_download: Vec<Uid>,
    pub link_only: Vec<(Uid, GMsgId)>,
}

pub fn split_downloads(
    to_fetch: &[Uid],
    server_g_msgids: &HashMap<Uid, GMsgId>,
    known_g_msgids: &HashSet<GMsgId>,
) -> DownloadPlan {
    let mut plan = DownloadPlan::default();
    for uid in to_fetch {
        match server_g_msgids.get(uid) {
            Some(g_msgid) if known_g_msgids.contains(g_msgid) => {
                plan.link_only.push((*uid, *g_msgid));
            }
            // A uid the server stopped reporting between SEARCH and FETCH
            // lands in full_download and simply fetches nothing.
            _ => plan.full_download.push(*uid),
        }
    }
    plan
}
