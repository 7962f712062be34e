use std::collections::HashMap;

use anyhow::Result;

use crate::storage::Store;
use crate::types::CursorValues;

/// Per-folder sync checkpoints for one account, loaded up front so
/// incremental polls can compare STATUS results without touching folders.
pub struct CursorCache {
    inner: HashMap<String, CursorValues>,
}

impl CursorCache {
    pub async fn load(store: &Store, email: &str, folders: &[String]) -> Result<Self> {
        let mut inner = HashMap::new();
        for cursor in store.load_cursors(email).await? {
            if folders.contains(&cursor.folder) {
                inner.insert(cursor.folder.clone(), cursor.values());
            }
        }
        Ok(Self { inner })
    }

    /// `None` means "never synced". Any real server marker compares
    /// greater, so first contact always takes the full pass.
    pub fn get(&self, folder: &str) -> Option<CursorValues> {
        self.inner.get(folder).copied()
    }
}
