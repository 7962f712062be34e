//! Engine scenarios driven against a scripted in-memory mail server and an
//! on-disk sqlite store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use spool::accounts::Accounts;
use spool::blob::BlobStore;
use spool::mail::{
    FetchedMessage, FetchedPart, FolderStatus, MailClient, MailError, SelectedFolder,
};
use spool::storage::Store;
use spool::sync::SyncEngine;
use spool::types::{now_ts, Account, GMsgId, MessageMeta, Uid};

const EMAIL: &str = "user@example.com";

#[derive(Clone)]
struct MockMessage {
    g_msgid: GMsgId,
    flags: Vec<String>,
    modseq: u64,
    body: Vec<u8>,
}

#[derive(Clone, Default)]
struct MockFolder {
    uid_validity: u32,
    highestmodseq: u64,
    messages: BTreeMap<Uid, MockMessage>,
}

#[derive(Default)]
struct MockServer {
    folders: BTreeMap<String, MockFolder>,
    /// When set, the next fetch_uids call fails once with a transient error.
    fail_next_fetch: bool,
    /// Uids whose body fetch fails with a MIME decode error.
    fail_encoding_uids: HashSet<Uid>,
    /// Total uids that went through a body fetch.
    body_fetches: usize,
    connects: usize,
}

impl MockServer {
    fn seed_folder(
        &mut self,
        name: &str,
        uid_validity: u32,
        highestmodseq: u64,
        messages: &[(Uid, GMsgId)],
    ) {
        let folder = MockFolder {
            uid_validity,
            highestmodseq,
            messages: messages
                .iter()
                .map(|(uid, g_msgid)| {
                    (
                        *uid,
                        MockMessage {
                            g_msgid: *g_msgid,
                            flags: Vec::new(),
                            modseq: highestmodseq,
                            body: format!("body of {g_msgid}").into_bytes(),
                        },
                    )
                })
                .collect(),
        };
        self.folders.insert(name.to_string(), folder);
    }

    fn folder_mut(&mut self, name: &str) -> &mut MockFolder {
        self.folders.get_mut(name).expect("folder seeded")
    }
}

struct MockClient {
    email: String,
    folders_order: Vec<String>,
    chunk_size: usize,
    server: Arc<Mutex<MockServer>>,
    selected: Option<String>,
}

impl MockClient {
    fn selected(&self) -> Result<String, MailError> {
        self.selected
            .clone()
            .ok_or_else(|| MailError::Transient("no folder selected".into()))
    }
}

#[async_trait]
impl MailClient for MockClient {
    fn email_address(&self) -> &str {
        &self.email
    }

    fn sync_folders(&self) -> &[String] {
        &self.folders_order
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn select_folder(&mut self, folder: &str) -> Result<SelectedFolder, MailError> {
        let server = self.server.lock().unwrap();
        let state = server
            .folders
            .get(folder)
            .ok_or_else(|| MailError::Transient(format!("no such folder {folder}")))?;
        let selected = SelectedFolder {
            name: folder.to_string(),
            uid_validity: state.uid_validity,
            highestmodseq: state.highestmodseq,
            exists: state.messages.len() as u32,
        };
        drop(server);
        self.selected = Some(folder.to_string());
        Ok(selected)
    }

    async fn folder_status(&mut self, folder: &str) -> Result<FolderStatus, MailError> {
        let server = self.server.lock().unwrap();
        let state = server
            .folders
            .get(folder)
            .ok_or_else(|| MailError::Transient(format!("no such folder {folder}")))?;
        Ok(FolderStatus {
            uid_validity: state.uid_validity,
            highestmodseq: state.highestmodseq,
        })
    }

    async fn all_uids(&mut self) -> Result<Vec<Uid>, MailError> {
        let folder = self.selected()?;
        let server = self.server.lock().unwrap();
        Ok(server.folders[&folder].messages.keys().copied().collect())
    }

    async fn search_changed_since(&mut self, highestmodseq: u64) -> Result<Vec<Uid>, MailError> {
        let folder = self.selected()?;
        let server = self.server.lock().unwrap();
        Ok(server.folders[&folder]
            .messages
            .iter()
            .filter(|(_, m)| m.modseq > highestmodseq && !m.flags.iter().any(|f| f == "Deleted"))
            .map(|(uid, _)| *uid)
            .collect())
    }

    async fn fetch_g_msgids(&mut self, uids: &[Uid]) -> Result<HashMap<Uid, GMsgId>, MailError> {
        let folder = self.selected()?;
        let server = self.server.lock().unwrap();
        Ok(uids
            .iter()
            .filter_map(|uid| {
                server.folders[&folder]
                    .messages
                    .get(uid)
                    .map(|m| (*uid, m.g_msgid))
            })
            .collect())
    }

    async fn fetch_uids(&mut self, uids: &[Uid]) -> Result<Vec<FetchedMessage>, MailError> {
        let folder = self.selected()?;
        let mut server = self.server.lock().unwrap();

        if server.fail_next_fetch {
            server.fail_next_fetch = false;
            return Err(MailError::Transient("connection dropped".into()));
        }
        if let Some(uid) = uids.iter().find(|u| server.fail_encoding_uids.contains(u)) {
            return Err(MailError::Encoding {
                uid: *uid,
                reason: "bad MIME".into(),
            });
        }

        server.body_fetches += uids.len();

        let mut out = Vec::new();
        for uid in uids {
            let Some(message) = server.folders[&folder].messages.get(uid) else {
                continue;
            };
            out.push(FetchedMessage {
                uid: *uid,
                g_msgid: message.g_msgid,
                flags: message.flags.clone(),
                meta: MessageMeta {
                    account_email: self.email.clone(),
                    g_msgid: message.g_msgid,
                    subject: Some(format!("message {}", message.g_msgid)),
                    from_addr: Some("sender@example.com".into()),
                    to_addrs: Some(self.email.clone()),
                    cc_addrs: None,
                    bcc_addrs: None,
                    internal_date: Some(1_700_000_000),
                    size_bytes: Some(message.body.len() as u32),
                    created_at: now_ts(),
                },
                parts: vec![FetchedPart {
                    part_id: 0,
                    mime_type: "text/plain".into(),
                    filename: None,
                    data: message.body.clone(),
                }],
            });
        }
        Ok(out)
    }

    async fn fetch_flags(&mut self, uids: &[Uid]) -> Result<HashMap<Uid, Vec<String>>, MailError> {
        let folder = self.selected()?;
        let server = self.server.lock().unwrap();
        Ok(uids
            .iter()
            .filter_map(|uid| {
                server.folders[&folder]
                    .messages
                    .get(uid)
                    .map(|m| (*uid, m.flags.clone()))
            })
            .collect())
    }
}

struct MockAccounts {
    server: Arc<Mutex<MockServer>>,
    folders_order: Vec<String>,
    chunk_size: usize,
}

#[async_trait]
impl Accounts for MockAccounts {
    type Client = MockClient;

    async fn connect(&self, email: &str) -> Result<MockClient, MailError> {
        self.server.lock().unwrap().connects += 1;
        Ok(MockClient {
            email: email.to_string(),
            folders_order: self.folders_order.clone(),
            chunk_size: self.chunk_size,
            server: Arc::clone(&self.server),
            selected: None,
        })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<Store>,
    server: Arc<Mutex<MockServer>>,
    engine: SyncEngine<MockAccounts>,
}

async fn harness(folders: &[&str]) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(
        Store::open(&dir.path().join("spool.db"))
            .await
            .expect("opening store"),
    );
    let blobs = Arc::new(BlobStore::open(dir.path().join("blobs")).expect("opening blobs"));

    let sync_folders: Vec<String> = folders.iter().map(|f| f.to_string()).collect();
    store
        .upsert_account(&Account {
            email: EMAIL.to_string(),
            initial_sync_done: false,
            sync_folders: sync_folders.clone(),
            created_at: now_ts(),
            updated_at: now_ts(),
        })
        .await
        .expect("seeding account");

    let server = Arc::new(Mutex::new(MockServer::default()));
    let accounts = MockAccounts {
        server: Arc::clone(&server),
        folders_order: sync_folders,
        chunk_size: 2,
    };
    let engine = SyncEngine::new(Arc::clone(&store), blobs, accounts);

    Harness {
        _dir: dir,
        store,
        server,
        engine,
    }
}

async fn membership_flags(store: &Store, folder: &str, uid: Uid) -> Option<Vec<String>> {
    store
        .load_memberships_by_uids(EMAIL, folder, &[uid])
        .await
        .expect("loading membership")
        .remove(&uid)
        .map(|m| m.flags)
}

#[tokio::test]
async fn cold_start_seeds_one_folder() {
    let h = harness(&["Inbox"]).await;
    h.server
        .lock()
        .unwrap()
        .seed_folder("Inbox", 1, 100, &[(10, 1001), (11, 1002), (12, 1003)]);

    h.engine.initial_sync(EMAIL).await.expect("initial sync");

    assert_eq!(h.store.count_message_meta(EMAIL).await.unwrap(), 3);
    assert_eq!(h.store.count_memberships(EMAIL).await.unwrap(), 3);
    assert_eq!(h.store.count_message_parts(EMAIL).await.unwrap(), 3);

    let cursor = h
        .store
        .load_cursor(EMAIL, "Inbox")
        .await
        .unwrap()
        .expect("cursor exists");
    assert_eq!(cursor.uid_validity, 1);
    assert_eq!(cursor.highestmodseq, 100);

    let account = h.store.load_account(EMAIL).await.unwrap().unwrap();
    assert!(account.initial_sync_done);
}

#[tokio::test]
async fn cross_folder_sync_links_without_refetching_bodies() {
    let h = harness(&["Inbox", "All Mail"]).await;
    {
        let mut server = h.server.lock().unwrap();
        server.seed_folder("Inbox", 1, 100, &[(10, 1001), (11, 1002), (12, 1003)]);
        server.seed_folder("All Mail", 7, 90, &[(50, 1001), (51, 1002), (52, 1003)]);
    }

    h.engine.initial_sync(EMAIL).await.expect("initial sync");

    assert_eq!(h.store.count_message_meta(EMAIL).await.unwrap(), 3);
    assert_eq!(h.store.count_memberships(EMAIL).await.unwrap(), 6);
    // Inbox is higher priority, so only its three bodies went over the wire.
    assert_eq!(h.server.lock().unwrap().body_fetches, 3);

    let metrics = h.engine.metrics();
    assert_eq!(metrics.linked_memberships.load(Ordering::Relaxed), 3);
}

#[tokio::test]
async fn incremental_sync_applies_flag_change_and_advances_cursor() {
    let h = harness(&["Inbox"]).await;
    h.server
        .lock()
        .unwrap()
        .seed_folder("Inbox", 1, 100, &[(10, 1001), (11, 1002), (12, 1003)]);
    h.engine.initial_sync(EMAIL).await.expect("initial sync");

    {
        let mut server = h.server.lock().unwrap();
        let folder = server.folder_mut("Inbox");
        folder.highestmodseq = 105;
        let message = folder.messages.get_mut(&11).unwrap();
        message.flags = vec!["Seen".to_string()];
        message.modseq = 105;
    }

    h.engine
        .incremental_sync(EMAIL)
        .await
        .expect("incremental sync");

    assert_eq!(
        membership_flags(&h.store, "Inbox", 11).await,
        Some(vec!["Seen".to_string()])
    );
    assert_eq!(h.store.count_message_meta(EMAIL).await.unwrap(), 3);
    let cursor = h.store.load_cursor(EMAIL, "Inbox").await.unwrap().unwrap();
    assert_eq!(cursor.highestmodseq, 105);
    // Flag updates never refetch bodies.
    assert_eq!(h.server.lock().unwrap().body_fetches, 3);
}

#[tokio::test]
async fn remote_delete_removes_membership_but_keeps_meta() {
    let h = harness(&["Inbox"]).await;
    h.server
        .lock()
        .unwrap()
        .seed_folder("Inbox", 1, 100, &[(10, 1001), (11, 1002), (12, 1003)]);
    h.engine.initial_sync(EMAIL).await.expect("initial sync");

    {
        let mut server = h.server.lock().unwrap();
        let folder = server.folder_mut("Inbox");
        folder.messages.remove(&11);
        folder.highestmodseq = 106;
    }

    h.engine
        .incremental_sync(EMAIL)
        .await
        .expect("incremental sync");

    assert_eq!(h.store.count_memberships(EMAIL).await.unwrap(), 2);
    assert!(membership_flags(&h.store, "Inbox", 11).await.is_none());
    // Meta outlives its memberships; reclaiming it is the GC worker's job.
    assert_eq!(h.store.count_message_meta(EMAIL).await.unwrap(), 3);
}

#[tokio::test]
async fn transient_fetch_failure_reconnects_once_and_succeeds() {
    let h = harness(&["Inbox"]).await;
    {
        let mut server = h.server.lock().unwrap();
        server.seed_folder("Inbox", 1, 100, &[(10, 1001), (11, 1002), (12, 1003)]);
        server.fail_next_fetch = true;
    }

    h.engine.initial_sync(EMAIL).await.expect("initial sync");

    assert_eq!(h.store.count_message_meta(EMAIL).await.unwrap(), 3);
    assert_eq!(h.store.count_memberships(EMAIL).await.unwrap(), 3);

    let metrics = h.engine.metrics();
    assert_eq!(metrics.reconnects.load(Ordering::Relaxed), 1);
    // One connect for the sync, one for the retry.
    assert_eq!(h.server.lock().unwrap().connects, 2);
}

#[tokio::test]
async fn uidvalidity_regression_rewrites_uids_without_body_downloads() {
    let h = harness(&["Inbox"]).await;
    h.server
        .lock()
        .unwrap()
        .seed_folder("Inbox", 1, 100, &[(10, 1001), (11, 1002), (12, 1003)]);
    h.engine.initial_sync(EMAIL).await.expect("initial sync");

    // Mark a flag so the rewrite provably preserves membership state.
    {
        let mut server = h.server.lock().unwrap();
        let folder = server.folder_mut("Inbox");
        folder.messages.get_mut(&11).unwrap().flags = vec!["Seen".to_string()];
    }
    h.store
        .update_membership_flags(EMAIL, "Inbox", &[(11, vec!["Seen".to_string()])])
        .await
        .unwrap();

    // Server rebuilds the folder: lower UIDVALIDITY, renumbered uids.
    {
        let mut server = h.server.lock().unwrap();
        server.seed_folder("Inbox", 0, 120, &[(100, 1001), (101, 1002), (102, 1003)]);
        server
            .folder_mut("Inbox")
            .messages
            .get_mut(&101)
            .unwrap()
            .flags = vec!["Seen".to_string()];
    }

    h.engine
        .incremental_sync(EMAIL)
        .await
        .expect("incremental sync");

    let memberships = h.store.load_memberships(EMAIL, "Inbox").await.unwrap();
    let by_uid: BTreeMap<Uid, GMsgId> =
        memberships.iter().map(|m| (m.uid, m.g_msgid)).collect();
    let expected: BTreeMap<Uid, GMsgId> =
        [(100, 1001), (101, 1002), (102, 1003)].into_iter().collect();
    assert_eq!(by_uid, expected);
    assert_eq!(
        membership_flags(&h.store, "Inbox", 101).await,
        Some(vec!["Seen".to_string()])
    );

    // Same three bodies as the initial sync; the resync moved none.
    assert_eq!(h.server.lock().unwrap().body_fetches, 3);
    assert_eq!(h.store.count_message_meta(EMAIL).await.unwrap(), 3);

    let cursor = h.store.load_cursor(EMAIL, "Inbox").await.unwrap().unwrap();
    assert_eq!(cursor.uid_validity, 0);
    assert_eq!(cursor.highestmodseq, 120);
}

#[tokio::test]
async fn incremental_sync_is_idempotent_without_server_changes() {
    let h = harness(&["Inbox"]).await;
    h.server
        .lock()
        .unwrap()
        .seed_folder("Inbox", 1, 100, &[(10, 1001), (11, 1002), (12, 1003)]);
    h.engine.initial_sync(EMAIL).await.expect("initial sync");

    h.engine.incremental_sync(EMAIL).await.expect("first poll");
    let fetches_after_first = h.server.lock().unwrap().body_fetches;
    let cursor_after_first = h.store.load_cursor(EMAIL, "Inbox").await.unwrap().unwrap();

    h.engine.incremental_sync(EMAIL).await.expect("second poll");

    assert_eq!(h.server.lock().unwrap().body_fetches, fetches_after_first);
    assert_eq!(h.store.count_message_meta(EMAIL).await.unwrap(), 3);
    assert_eq!(h.store.count_memberships(EMAIL).await.unwrap(), 3);
    let cursor_after_second = h.store.load_cursor(EMAIL, "Inbox").await.unwrap().unwrap();
    assert_eq!(
        cursor_after_first.highestmodseq,
        cursor_after_second.highestmodseq
    );
}

#[tokio::test]
async fn rerun_initial_sync_resumes_and_catches_up() {
    let h = harness(&["Inbox"]).await;
    h.server
        .lock()
        .unwrap()
        .seed_folder("Inbox", 1, 100, &[(10, 1001), (11, 1002), (12, 1003)]);
    h.engine.initial_sync(EMAIL).await.expect("initial sync");

    // Between restarts: uid 10 vanished, uid 13 arrived.
    {
        let mut server = h.server.lock().unwrap();
        let folder = server.folder_mut("Inbox");
        folder.messages.remove(&10);
        folder.messages.insert(
            13,
            MockMessage {
                g_msgid: 1004,
                flags: Vec::new(),
                modseq: 110,
                body: b"body of 1004".to_vec(),
            },
        );
        folder.highestmodseq = 110;
    }

    h.engine.initial_sync(EMAIL).await.expect("resumed sync");

    let memberships = h.store.load_memberships(EMAIL, "Inbox").await.unwrap();
    let uids: Vec<Uid> = memberships.iter().map(|m| m.uid).collect();
    assert_eq!(uids, vec![11, 12, 13]);
    // Only the new message's body was fetched on the rerun.
    assert_eq!(h.server.lock().unwrap().body_fetches, 4);
    // Meta for the vanished uid's message is retained.
    assert_eq!(h.store.count_message_meta(EMAIL).await.unwrap(), 4);

    let cursor = h.store.load_cursor(EMAIL, "Inbox").await.unwrap().unwrap();
    assert_eq!(cursor.highestmodseq, 110);
}

#[tokio::test]
async fn encoding_failure_skips_folder_but_syncs_the_rest() {
    let h = harness(&["Inbox", "All Mail"]).await;
    {
        let mut server = h.server.lock().unwrap();
        server.seed_folder("Inbox", 1, 100, &[(10, 1001), (11, 1002)]);
        server.seed_folder("All Mail", 7, 90, &[(50, 2001)]);
        server.fail_encoding_uids.insert(10);
    }

    h.engine.initial_sync(EMAIL).await.expect("initial sync");

    // Inbox aborted before recording a checkpoint; All Mail completed.
    assert!(h.store.load_cursor(EMAIL, "Inbox").await.unwrap().is_none());
    assert!(h
        .store
        .load_cursor(EMAIL, "All Mail")
        .await
        .unwrap()
        .is_some());
    assert_eq!(h.store.count_memberships(EMAIL).await.unwrap(), 1);
}

#[tokio::test]
async fn cursor_advance_is_monotone() {
    let h = harness(&["Inbox"]).await;

    assert!(h.store.advance_cursor(EMAIL, "Inbox", 1, 100).await.unwrap());
    assert!(h.store.advance_cursor(EMAIL, "Inbox", 1, 105).await.unwrap());
    // Regression is rejected and leaves the stored value alone.
    assert!(!h.store.advance_cursor(EMAIL, "Inbox", 1, 90).await.unwrap());

    let cursor = h.store.load_cursor(EMAIL, "Inbox").await.unwrap().unwrap();
    assert_eq!(cursor.highestmodseq, 105);
}
