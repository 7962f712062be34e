use std::collections::HashSet;

use crate::types::Uid;

/// Disjoint uid sets from comparing server and local folder state.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FolderDiff {
    /// Local but no longer on the server.
    pub to_delete: Vec<Uid>,
    /// On the server but unknown locally.
    pub to_fetch: Vec<Uid>,
}

pub fn diff_uids(server_uids: &[Uid], local_uids: &[Uid]) -> FolderDiff {
    let server: HashSet<Uid> = server_uids.iter().copied().collect();
    let local: HashSet<Uid> = local_uids.iter().copied().collect();

    let mut to_delete: Vec<Uid> = local.difference(&server).copied().collect();
    let mut to_fetch: Vec<Uid> = server.difference(&local).copied().collect();
    to_delete.sort_unstable();
    to_fetch.sort_unstable();

    FolderDiff {
        to_delete,
        to_fetch,
    }
}

/// Splits a CONDSTORE search result into uids we have never seen in this
/// folder and uids whose metadata moved past the checkpoint.
pub fn split_new_updated(changed: &[Uid], local_uids: &HashSet<Uid>) -> (Vec<Uid>, Vec<Uid>) {
    let mut new = Vec::new();
    let mut updated = Vec::new();
    for uid in changed {
        if local_uids.contains(uid) {
            updated.push(*uid);
        } else {
            new.push(*uid);
        }
    }
    new.sort_unstable();
    updated.sort_unstable();
    (new, updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_produces_disjoint_sorted_sets() {
        let diff = diff_uids(&[12, 10, 13], &[11, 10]);
        assert_eq!(diff.to_delete, vec![11]);
        assert_eq!(diff.to_fetch, vec![12, 13]);
    }

    #[test]
    fn diff_of_identical_sets_is_empty() {
        let diff = diff_uids(&[1, 2, 3], &[3, 2, 1]);
        assert_eq!(diff, FolderDiff::default());
    }

    #[test]
    fn diff_against_empty_local_fetches_everything() {
        let diff = diff_uids(&[10, 11, 12], &[]);
        assert!(diff.to_delete.is_empty());
        assert_eq!(diff.to_fetch, vec![10, 11, 12]);
    }

    #[test]
    fn changed_uids_split_by_local_presence() {
        let local: HashSet<Uid> = [10, 11].into_iter().collect();
        let (new, updated) = split_new_updated(&[11, 40, 10, 41], &local);
        assert_eq!(new, vec![40, 41]);
        assert_eq!(updated, vec![10, 11]);
    }
}
