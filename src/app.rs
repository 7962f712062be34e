use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tracing::{info, warn};

use crate::accounts::{onboard_account, Accounts, GmailAccounts};
use crate::blob::BlobStore;
use crate::cli::{Cli, Command};
use crate::config::AppDefaults;
use crate::storage::{default_data_dir, Store};
use crate::sync::SyncEngine;
use crate::types::Account;

pub async fn run(cli: Cli) -> Result<()> {
    let defaults = AppDefaults::load()?;
    let store = Arc::new(Store::new_default().await?);
    let blobs = Arc::new(BlobStore::open(default_data_dir()?.join("blobs"))?);
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        blobs,
        GmailAccounts::new(defaults.clone()),
    ));

    match cli.command {
        Command::AddAccount => {
            let account = onboard_account(&store, &defaults).await?;
            info!(account = %account.email, "Account ready; run `spool sync` to seed it");
            Ok(())
        }
        Command::Sync { email, initial } => {
            let accounts = select_accounts(&store, email.as_deref()).await?;
            let mut failures = 0usize;
            for account in &accounts {
                if sync_account(&engine, account, initial).await.is_err() {
                    failures += 1;
                }
            }
            report_metrics(&engine);
            anyhow::ensure!(failures == 0, "{failures} account(s) failed to sync");
            Ok(())
        }
        Command::Daemon => daemon_loop(engine, store, defaults).await,
    }
}

async fn select_accounts(store: &Store, email: Option<&str>) -> Result<Vec<Account>> {
    let accounts: Vec<Account> = match email {
        Some(email) => store.load_account(email).await?.into_iter().collect(),
        None => store.list_accounts().await?,
    };
    anyhow::ensure!(
        !accounts.is_empty(),
        "no accounts configured; run `spool add-account` first"
    );
    Ok(accounts)
}

async fn sync_account<A: Accounts>(
    engine: &SyncEngine<A>,
    account: &Account,
    force_initial: bool,
) -> Result<()> {
    let result = if force_initial || !account.initial_sync_done {
        engine.initial_sync(&account.email).await
    } else {
        engine.incremental_sync(&account.email).await
    };
    if let Err(e) = &result {
        warn!(account = %account.email, error = %e, "Account sync failed");
    }
    result
}

async fn daemon_loop(
    engine: Arc<SyncEngine<GmailAccounts>>,
    store: Arc<Store>,
    defaults: AppDefaults,
) -> Result<()> {
    let cancel = engine.cancel_flag();
    tokio::spawn({
        let cancel = Arc::clone(&cancel);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; finishing current chunks");
                cancel.store(true, Ordering::Relaxed);
            }
        }
    });

    let interval = Duration::from_secs(u64::from(defaults.poll_interval_minutes) * 60);
    loop {
        let accounts = store.list_accounts().await?;
        if accounts.is_empty() {
            warn!("No accounts configured; run `spool add-account` first");
        }

        // One task per account. Parallelism is across accounts only: a
        // mail session is a single authenticated connection, so within an
        // account everything runs sequentially.
        let tasks: Vec<_> = accounts
            .into_iter()
            .map(|account| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let _ = sync_account(&engine, &account, false).await;
                })
            })
            .collect();

        for task in join_all(tasks).await {
            if let Err(e) = task {
                warn!(error = %e, "Account sync task panicked");
            }
        }

        report_metrics(&engine);
        if cancel.load(Ordering::Relaxed) {
            info!("Daemon stopped");
            return Ok(());
        }

        let mut slept = Duration::ZERO;
        while slept < interval && !cancel.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            slept += Duration::from_secs(1);
        }
        if cancel.load(Ordering::Relaxed) {
            info!("Daemon stopped");
            return Ok(());
        }
    }
}

fn report_metrics<A: Accounts>(engine: &SyncEngine<A>) {
    let metrics = engine.metrics();
    info!(
        commit_failures = metrics.commit_failures.load(Ordering::Relaxed),
        reconnects = metrics.reconnects.load(Ordering::Relaxed),
        bodies_fetched = metrics.bodies_fetched.load(Ordering::Relaxed),
        linked_memberships = metrics.linked_memberships.load(Ordering::Relaxed),
        "Sync metrics"
    );
}
