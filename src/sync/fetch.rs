use std::sync::atomic::Ordering;

use tracing::warn;

use super::SyncMetrics;
use crate::accounts::Accounts;
use crate::mail::{FetchedMessage, MailClient, MailError};
use crate::types::Uid;

/// Fetches one chunk of bodies with the reconnect-once policy.
///
/// An encoding failure is fatal for the chunk and propagates unchanged.
/// Any other failure gets exactly one retry on a fresh client obtained from
/// `Accounts`; the fresh client re-selects the folder before the retry, and
/// a second failure propagates.
pub(crate) async fn fetch_chunk<A: Accounts>(
    accounts: &A,
    client: &mut A::Client,
    folder: &str,
    uids: &[Uid],
    metrics: &SyncMetrics,
) -> Result<Vec<FetchedMessage>, MailError> {
    debug_assert!(uids.len() <= client.chunk_size());

    match client.fetch_uids(uids).await {
        Ok(messages) => Ok(messages),
        Err(err @ MailError::Encoding { .. }) => Err(err),
        Err(MailError::Transient(reason)) => {
            warn!(folder = %folder, error = %reason, "Fetch failure; reconnecting");
            metrics.reconnects.fetch_add(1, Ordering::Relaxed);

            let email = client.email_address().to_string();
            let mut fresh = accounts.connect(&email).await?;
            fresh.select_folder(folder).await?;
            *client = fresh;

            client.fetch_uids(uids).await
        }
    }
}
