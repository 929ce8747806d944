use std::{path::PathBuf, time::Duration};

/// Everything the engine needs to serve one user's MH store.
///
/// The acceptor hands us an already-authenticated byte stream; the only
/// mandatory piece of configuration is where that user's mail lives.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the user's MH mail store.
    pub mh_root: PathBuf,
    /// Aggregate byte budget of the parsed-message cache.
    pub cache_max_bytes: usize,
    /// How long a folder with no attached clients stays in memory.
    pub folder_idle_expiry: Duration,
    /// How long the per-user server lingers with no sessions before exiting.
    pub user_idle_exit: Duration,
    /// How long to poll for the MH advisory dot-lock before giving up.
    pub lock_timeout: Duration,
    /// Largest `{N}` literal we accept from a client.
    pub max_literal_size: usize,
}

impl Config {
    pub fn new(mh_root: impl Into<PathBuf>) -> Self {
        Config {
            mh_root: mh_root.into(),
            cache_max_bytes: 40 * 1024 * 1024,
            folder_idle_expiry: Duration::from_secs(900),
            user_idle_exit: Duration::from_secs(1800),
            lock_timeout: Duration::from_secs(2),
            max_literal_size: 32 * 1024 * 1024,
        }
    }
}
