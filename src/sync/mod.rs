//! The sync engine: reconciles remote folder state against the local store
//! using UIDVALIDITY and HIGHESTMODSEQ checkpoints, deduplicates message
//! bodies across folders by g_msgid, and drives chunked fetch/persist with
//! restartable semantics.
//!
//! Two entry routines per account: `initial_sync` seeds the store from
//! empty or partial state; `incremental_sync` is polled to track new,
//! updated, and deleted messages per folder. Folders are processed
//! sequentially in priority order; cursor advancement is always the last
//! step for a folder, so a crash or discarded batch makes the next run
//! re-observe the same work.

pub mod cursor;
pub mod dedup;
pub mod fetch;
pub mod reconcile;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::accounts::Accounts;
use crate::blob::BlobStore;
use crate::mail::{FetchedMessage, MailClient, SelectedFolder};
use crate::storage::Store;
use crate::types::{
    normalize_flags, CursorValues, FolderMembership, GMsgId, MessageMeta, MessagePart, Uid,
};

use self::cursor::CursorCache;

/// Flags-only fetches return tiny payloads, so the refresh path batches a
/// larger multiple of the body chunk size.
const FLAG_CHUNK_FACTOR: usize = 5;

/// Counters making the availability-over-consistency commit policy (and
/// the rest of the engine's behavior) observable.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub commit_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub bodies_fetched: AtomicU64,
    pub linked_memberships: AtomicU64,
}

pub struct SyncEngine<A: Accounts> {
    store: Arc<Store>,
    blobs: Arc<BlobStore>,
    accounts: A,
    metrics: Arc<SyncMetrics>,
    cancel: Arc<AtomicBool>,
}

impl<A: Accounts> SyncEngine<A> {
    pub fn new(store: Arc<Store>, blobs: Arc<BlobStore>, accounts: A) -> Self {
        Self {
            store,
            blobs,
            accounts,
            metrics: Arc::new(SyncMetrics::default()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Cooperative cancellation, observed at chunk boundaries: the current
    /// chunk finishes its commit, the cursor is not advanced, and the task
    /// exits cleanly.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Downloads entire messages, seeding the metadata store and the blob
    /// store. Restartable: whatever a previous interrupted run persisted is
    /// skipped, and an existing lagging cursor triggers a metadata
    /// catch-up.
    pub async fn initial_sync(&self, email: &str) -> Result<()> {
        let mut client = self
            .accounts
            .connect(email)
            .await
            .context("connecting mail client")?;

        info!(account = %email, "Starting initial sync");

        let folders = client.sync_folders().to_vec();
        for folder in &folders {
            if self.cancelled() {
                info!(account = %email, "Cancelled; stopping initial sync");
                return Ok(());
            }
            if let Err(e) = self.initial_sync_folder(&mut client, email, folder).await {
                warn!(account = %email, folder = %folder, error = %e, "Folder sync failed");
            }
        }

        if self.cancelled() {
            return Ok(());
        }

        self.store.mark_initial_sync_done(email).await?;
        info!(account = %email, "Initial sync finished");
        Ok(())
    }

    /// Polled routine: checks every sync folder's STATUS and runs a
    /// highestmodseq update on those that moved. Folders that did not
    /// change are never selected, which on Gmail is the common case.
    pub async fn incremental_sync(&self, email: &str) -> Result<()> {
        let mut client = self
            .accounts
            .connect(email)
            .await
            .context("connecting mail client")?;

        let folders = client.sync_folders().to_vec();
        let cache = CursorCache::load(&self.store, email, &folders).await?;

        let mut needs_update: Vec<(String, Option<CursorValues>)> = Vec::new();
        for folder in &folders {
            let status = match client.folder_status(folder).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(account = %email, folder = %folder, error = %e, "STATUS failed; skipping folder");
                    continue;
                }
            };
            let cached = cache.get(folder);
            if cached.map_or(true, |c| status.highestmodseq > c.highestmodseq) {
                needs_update.push((folder.clone(), cached));
            } else {
                debug!(account = %email, folder = %folder, "No changes (HIGHESTMODSEQ unchanged)");
            }
        }

        for (folder, cached) in needs_update {
            if self.cancelled() {
                info!(account = %email, "Cancelled; stopping incremental sync");
                return Ok(());
            }
            if let Err(e) = self
                .highestmodseq_update(&mut client, email, &folder, cached)
                .await
            {
                warn!(account = %email, folder = %folder, error = %e, "Folder update failed");
            }
        }

        Ok(())
    }

    async fn initial_sync_folder(
        &self,
        client: &mut A::Client,
        email: &str,
        folder: &str,
    ) -> Result<()> {
        let selected = client.select_folder(folder).await?;
        let selected = self.check_uidvalidity(client, email, selected).await?;

        let server_uids = client.all_uids().await?;
        info!(account = %email, folder = %folder, count = server_uids.len(), "Found server UIDs");

        let server_g_msgids = client.fetch_g_msgids(&server_uids).await?;
        let known_g_msgids = self.store.distinct_g_msgids(email).await?;
        let existing_uids = self.store.membership_uids(email, folder).await?;
        info!(account = %email, folder = %folder, existing = existing_uids.len(), "Already have local memberships");

        let mut clean = true;

        // Memberships that vanished between restarts.
        let diff = reconcile::diff_uids(&server_uids, &existing_uids);
        if !diff.to_delete.is_empty() {
            warn!(
                account = %email,
                folder = %folder,
                uids = ?diff.to_delete,
                "Deleting UIDs that no longer exist on the server"
            );
            let res = self
                .store
                .delete_memberships(email, folder, &diff.to_delete)
                .await
                .map(|_| ());
            if !self.note_commit(res, email, folder, "membership delete") {
                clean = false;
            }
        }

        let plan = dedup::split_downloads(&diff.to_fetch, &server_g_msgids, &known_g_msgids);

        if !plan.link_only.is_empty() {
            info!(
                account = %email,
                folder = %folder,
                count = plan.link_only.len(),
                "Linking messages already downloaded via other folders"
            );
            let memberships: Vec<FolderMembership> = plan
                .link_only
                .iter()
                .map(|(uid, g_msgid)| FolderMembership::link(email, folder, *uid, *g_msgid))
                .collect();
            let count = memberships.len() as u64;
            let res = self.store.insert_memberships(&memberships).await;
            if self.note_commit(res, email, folder, "link-only insert") {
                self.metrics
                    .linked_memberships
                    .fetch_add(count, Ordering::Relaxed);
            } else {
                clean = false;
            }
        }

        let chunk_size = client.chunk_size().max(1);
        info!(
            account = %email,
            folder = %folder,
            to_fetch = plan.full_download.len(),
            chunk_size,
            "Starting body download"
        );

        let mut synced = existing_uids.len();
        for chunk in plan.full_download.chunks(chunk_size) {
            if self.cancelled() {
                info!(account = %email, folder = %folder, "Cancelled; stopping before next chunk");
                return Ok(());
            }
            let messages =
                fetch::fetch_chunk(&self.accounts, client, folder, chunk, &self.metrics).await?;
            let res = self.persist_fetched(email, folder, messages).await;
            if !self.note_commit(res, email, folder, "chunk persist") {
                clean = false;
            }
            synced += chunk.len();
            info!(
                account = %email,
                folder = %folder,
                synced,
                total = server_uids.len(),
                "Synced chunk"
            );
        }

        // A restarted run may already have a cursor for this folder. If its
        // checkpoint lags the selected folder, metadata changed during the
        // interruption; catch up before recording completion. Messages the
        // UID pass above already downloaded are skipped by the update.
        match self.store.load_cursor(email, folder).await? {
            Some(cached) => {
                if cached.highestmodseq < selected.highestmodseq {
                    self.highestmodseq_update(client, email, folder, Some(cached.values()))
                        .await?;
                }
            }
            None => {
                if clean {
                    self.store
                        .advance_cursor(email, folder, selected.uid_validity, selected.highestmodseq)
                        .await?;
                    info!(
                        account = %email,
                        folder = %folder,
                        uid_validity = selected.uid_validity,
                        highestmodseq = selected.highestmodseq,
                        "Folder synced to checkpoint"
                    );
                } else {
                    warn!(
                        account = %email,
                        folder = %folder,
                        "Commit failures during sync; checkpoint not recorded"
                    );
                }
            }
        }

        Ok(())
    }

    /// CONDSTORE catch-up for one folder with an existing baseline: fetch
    /// everything whose modseq moved past it, refresh changed flags, purge
    /// deletions, then advance the cursor.
    async fn highestmodseq_update(
        &self,
        client: &mut A::Client,
        email: &str,
        folder: &str,
        cached: Option<CursorValues>,
    ) -> Result<()> {
        let selected = client.select_folder(folder).await?;
        let selected = self.check_uidvalidity(client, email, selected).await?;

        let baseline = cached.map(|c| c.highestmodseq).unwrap_or(0);
        let changed = client.search_changed_since(baseline).await?;
        info!(
            account = %email,
            folder = %folder,
            highestmodseq = selected.highestmodseq,
            changed = changed.len(),
            "Starting highestmodseq update"
        );

        let mut clean = true;

        if !changed.is_empty() {
            let local_uids: HashSet<Uid> = self
                .store
                .membership_uids(email, folder)
                .await?
                .into_iter()
                .collect();
            let (new, updated) = reconcile::split_new_updated(&changed, &local_uids);

            let chunk_size = client.chunk_size().max(1);
            for chunk in new.chunks(chunk_size) {
                if self.cancelled() {
                    return Ok(());
                }
                let messages =
                    fetch::fetch_chunk(&self.accounts, client, folder, chunk, &self.metrics)
                        .await?;
                let res = self.persist_fetched(email, folder, messages).await;
                if !self.note_commit(res, email, folder, "chunk persist") {
                    clean = false;
                }
            }

            for chunk in updated.chunks(chunk_size * FLAG_CHUNK_FACTOR) {
                if self.cancelled() {
                    return Ok(());
                }
                let new_flags = client.fetch_flags(chunk).await?;
                let existing = self
                    .store
                    .load_memberships_by_uids(email, folder, chunk)
                    .await?;

                let mut updates = Vec::new();
                for (uid, flags) in new_flags {
                    let flags = normalize_flags(flags);
                    if let Some(membership) = existing.get(&uid) {
                        if membership.flags != flags {
                            updates.push((uid, flags));
                        }
                    }
                }
                if !updates.is_empty() {
                    debug!(
                        account = %email,
                        folder = %folder,
                        count = updates.len(),
                        "Updating changed flags"
                    );
                    let res = self
                        .store
                        .update_membership_flags(email, folder, &updates)
                        .await;
                    if !self.note_commit(res, email, folder, "flag update") {
                        clean = false;
                    }
                }
            }
        }

        if !self.remove_deleted(client, email, folder).await? {
            clean = false;
        }

        if self.cancelled() {
            return Ok(());
        }

        if clean {
            self.store
                .advance_cursor(email, folder, selected.uid_validity, selected.highestmodseq)
                .await?;
            debug!(
                account = %email,
                folder = %folder,
                highestmodseq = selected.highestmodseq,
                "Cursor advanced"
            );
        } else {
            warn!(
                account = %email,
                folder = %folder,
                "Commit failures during update; cursor not advanced"
            );
        }

        Ok(())
    }

    /// UIDVALIDITY gate. No cursor: accept anything. Server value at or
    /// above the cached one: proceed (a forward rebuild leaves cached UIDs
    /// resolvable via g_msgid). Server value below the cached one: the
    /// local UID space is invalid and must be resynced before any
    /// reconciliation touches membership rows.
    async fn check_uidvalidity(
        &self,
        client: &mut A::Client,
        email: &str,
        selected: SelectedFolder,
    ) -> Result<SelectedFolder> {
        match self.store.load_cursor(email, &selected.name).await? {
            None => Ok(selected),
            Some(cached) if selected.uid_validity >= cached.uid_validity => Ok(selected),
            Some(cached) => {
                info!(
                    account = %email,
                    folder = %selected.name,
                    cached_uid_validity = cached.uid_validity,
                    server_uid_validity = selected.uid_validity,
                    "UIDVALIDITY went backwards; resyncing UIDs"
                );
                self.resync_uids(client, email, &selected).await?;
                Ok(selected)
            }
        }
    }

    /// Fetches fresh `(uid, g_msgid)` pairs and substitutes the new uids
    /// for the old, keyed by the unchanged g_msgid. Rows whose g_msgid no
    /// longer appears in the folder are dropped. No bodies are
    /// re-downloaded, and the rewrite plus cursor reset commit atomically.
    async fn resync_uids(
        &self,
        client: &mut A::Client,
        email: &str,
        selected: &SelectedFolder,
    ) -> Result<()> {
        let server_uids = client.all_uids().await?;
        let pairs = client.fetch_g_msgids(&server_uids).await?;

        let mut uid_by_g_msgid: HashMap<GMsgId, Uid> = HashMap::with_capacity(pairs.len());
        for (uid, g_msgid) in &pairs {
            uid_by_g_msgid.insert(*g_msgid, *uid);
        }

        let local = self.store.load_memberships(email, &selected.name).await?;
        let mut rewritten = Vec::with_capacity(local.len());
        let mut dropped = 0usize;
        for membership in local {
            match uid_by_g_msgid.get(&membership.g_msgid) {
                Some(&uid) => rewritten.push(FolderMembership {
                    uid,
                    ..membership
                }),
                None => dropped += 1,
            }
        }

        self.store
            .resync_folder(
                email,
                &selected.name,
                &rewritten,
                selected.uid_validity,
                selected.highestmodseq,
            )
            .await?;

        info!(
            account = %email,
            folder = %selected.name,
            rewritten = rewritten.len(),
            dropped,
            "UID resync complete"
        );
        Ok(())
    }

    /// Deletion pass: a membership goes away exactly when its uid is absent
    /// from the server's full uid listing for the folder. Returns whether
    /// the commit (if any) applied.
    async fn remove_deleted(
        &self,
        client: &mut A::Client,
        email: &str,
        folder: &str,
    ) -> Result<bool> {
        let server_uids = client.all_uids().await?;
        let local_uids = self.store.membership_uids(email, folder).await?;
        let diff = reconcile::diff_uids(&server_uids, &local_uids);

        if diff.to_delete.is_empty() {
            return Ok(true);
        }

        info!(
            account = %email,
            folder = %folder,
            count = diff.to_delete.len(),
            "Purging messages deleted on the server"
        );
        let res = self
            .store
            .delete_memberships(email, folder, &diff.to_delete)
            .await
            .map(|_| ());
        Ok(self.note_commit(res, email, folder, "membership delete"))
    }

    /// Writes part payloads to the blob store, then commits meta, parts,
    /// and memberships for the chunk in one transaction. Blob writes are
    /// filesystem I/O, so the whole chunk assembly runs on the blocking
    /// pool and other account tasks keep progressing. A crash between the
    /// blob writes and the commit leaves unreferenced blobs for the GC
    /// worker.
    async fn persist_fetched(
        &self,
        email: &str,
        folder: &str,
        messages: Vec<FetchedMessage>,
    ) -> Result<()> {
        let count = messages.len() as u64;
        let blobs = Arc::clone(&self.blobs);
        let email = email.to_string();
        let folder = folder.to_string();

        type ChunkRows = (Vec<FolderMembership>, Vec<MessageMeta>, Vec<MessagePart>);
        let (memberships, metas, parts) =
            tokio::task::spawn_blocking(move || -> Result<ChunkRows> {
                let mut memberships = Vec::with_capacity(messages.len());
                let mut metas = Vec::with_capacity(messages.len());
                let mut parts = Vec::new();

                for message in messages {
                    let FetchedMessage {
                        uid,
                        g_msgid,
                        flags,
                        meta,
                        parts: fetched_parts,
                    } = message;

                    for part in fetched_parts {
                        let blob_ref = blobs.put(&part.data)?;
                        parts.push(MessagePart {
                            account_email: email.clone(),
                            g_msgid,
                            part_id: part.part_id,
                            mime_type: part.mime_type,
                            filename: part.filename,
                            blob_ref,
                            size_bytes: part.data.len() as u32,
                        });
                    }
                    metas.push(meta);
                    memberships.push(FolderMembership {
                        account_email: email.clone(),
                        folder: folder.clone(),
                        uid,
                        g_msgid,
                        flags,
                    });
                }

                Ok((memberships, metas, parts))
            })
            .await
            .context("blob write task panicked")??;

        self.store
            .persist_chunk(&memberships, &metas, &parts)
            .await?;
        self.metrics
            .bodies_fetched
            .fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// SafeCommit accounting: a failed batch is logged, counted, and
    /// discarded; the sync run keeps going and the caller withholds the
    /// cursor advance so the next poll re-observes the work.
    fn note_commit(&self, res: Result<()>, email: &str, folder: &str, what: &str) -> bool {
        match res {
            Ok(()) => true,
            Err(err) => {
                self.metrics.commit_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(db_err) = err.downcast_ref::<sqlx::Error>() {
                    warn!(
                        account = %email,
                        folder = %folder,
                        what,
                        error = %db_err,
                        "Transaction failed; batch discarded"
                    );
                } else {
                    warn!(
                        account = %email,
                        folder = %folder,
                        what,
                        error = %err,
                        "Unknown commit failure; batch discarded"
                    );
                }
                false
            }
        }
    }
}
