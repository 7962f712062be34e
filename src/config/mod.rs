use anyhow::Result;
use std::env;

/// Application-wide defaults. These can be overridden by env vars but do not
/// require any user-authored config files.
#[derive(Debug, Clone)]
pub struct AppDefaults {
    /// Folder sync priority order: message download for earlier folders is
    /// prioritized over later ones.
    pub sync_folders: Vec<String>,
    pub chunk_size: usize,
    pub poll_interval_minutes: u32,
}

impl AppDefaults {
    pub fn load() -> Result<Self> {
        let chunk_size = env::var("SPOOL_CHUNK_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(50);
        let poll_interval_minutes = env::var("SPOOL_POLL_INTERVAL_MINUTES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(5);

        let sync_folders = match env::var("SPOOL_SYNC_FOLDERS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => vec![
                "INBOX".to_string(),
                "[Gmail]/Sent Mail".to_string(),
                "[Gmail]/All Mail".to_string(),
            ],
        };

        Ok(Self {
            sync_folders,
            chunk_size,
            poll_interval_minutes,
        })
    }
}
