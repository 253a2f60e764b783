// 👀 Identifier Watchlist - the CIKs an operator wants ingested
//
// File format: one CIK per line, blank lines and `#` comments ignored.
// Readers get an immutable `Arc` snapshot; a reload swaps the whole set at once.

use log::{debug, error, info, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::model::normalize_cik;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Error)]
pub enum WatchlistError {
    #[error("cannot read watchlist {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}:{line}: {value:?} is not a CIK (expected 1-10 digits)")]
    Malformed {
        path: PathBuf,
        line: usize,
        value: String,
    },
}

/// Parse watchlist text into normalized CIKs. The first bad line fails the whole file.
pub fn parse_watchlist(path: &Path, content: &str) -> Result<HashSet<String>, WatchlistError> {
    let mut ciks = HashSet::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match normalize_cik(line) {
            Some(cik) => {
                ciks.insert(cik);
            }
            None => {
                return Err(WatchlistError::Malformed {
                    path: path.to_path_buf(),
                    line: index + 1,
                    value: line.to_string(),
                })
            }
        }
    }

    Ok(ciks)
}

fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub struct Watchlist {
    path: PathBuf,
    snapshot: RwLock<Arc<HashSet<String>>>,
    fingerprint: Mutex<Option<String>>,
}

impl Watchlist {
    /// Initial load. Malformed content is fatal; a missing file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Watchlist, WatchlistError> {
        let path = path.into();

        let (ciks, digest) = match read_if_present(&path)? {
            Some(bytes) => {
                let ciks = parse_watchlist(&path, &String::from_utf8_lossy(&bytes))?;
                (ciks, Some(fingerprint(&bytes)))
            }
            None => {
                warn!("watchlist {} not found; starting with no CIKs", path.display());
                (HashSet::new(), None)
            }
        };

        if ciks.is_empty() {
            warn!("watchlist {} is empty; nothing will be ingested", path.display());
        } else {
            info!("watchlist loaded: {} CIK(s) from {}", ciks.len(), path.display());
        }

        Ok(Watchlist {
            path,
            snapshot: RwLock::new(Arc::new(ciks)),
            fingerprint: Mutex::new(digest),
        })
    }

    /// Watchlist that never reads a file (tests, embedding)
    pub fn from_ciks<I, S>(ciks: I) -> Watchlist
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = ciks
            .into_iter()
            .filter_map(|c| normalize_cik(c.as_ref()))
            .collect();
        Watchlist {
            path: PathBuf::new(),
            snapshot: RwLock::new(Arc::new(set)),
            fingerprint: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent snapshot; never blocks on a reload in progress for long
    pub fn current(&self) -> Arc<HashSet<String>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read unconditionally. On error the previous snapshot stays in place.
    pub fn reload(&self) -> Result<usize, WatchlistError> {
        let content = read_if_present(&self.path)?;
        let digest = content.as_deref().map(fingerprint);
        self.apply(content.as_deref(), digest)
    }

    /// Reload only if the content fingerprint changed. Returns whether it did.
    /// A deleted file counts as a change to the empty list.
    pub fn check_for_changes(&self) -> Result<bool, WatchlistError> {
        let content = read_if_present(&self.path)?;
        let digest = content.as_deref().map(fingerprint);

        let unchanged = *self.fingerprint.lock().unwrap_or_else(PoisonError::into_inner) == digest;
        if unchanged {
            return Ok(false);
        }

        self.apply(content.as_deref(), digest)?;
        Ok(true)
    }

    fn apply(
        &self,
        content: Option<&[u8]>,
        digest: Option<String>,
    ) -> Result<usize, WatchlistError> {
        // remember the fingerprint even for bad content so it is reported once
        *self.fingerprint.lock().unwrap_or_else(PoisonError::into_inner) = digest;

        let ciks = match content {
            Some(bytes) => match parse_watchlist(&self.path, &String::from_utf8_lossy(bytes)) {
                Ok(ciks) => ciks,
                Err(e) => {
                    error!("watchlist reload rejected, keeping previous snapshot: {}", e);
                    return Err(e);
                }
            },
            None => {
                warn!("watchlist {} removed; no CIKs are watched until it returns", self.path.display());
                HashSet::new()
            }
        };

        let count = ciks.len();
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(ciks);
        info!("watchlist reloaded: {} CIK(s)", count);
        Ok(count)
    }
}

/// File content, or `None` when there is no file
fn read_if_present(path: &Path) -> Result<Option<Vec<u8>>, WatchlistError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(WatchlistError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ============================================================================
// BACKGROUND WATCHER
// ============================================================================

/// Reloads the watchlist when its file changes, off the tick thread
pub struct WatchlistWatcher {
    handle: JoinHandle<()>,
}

impl WatchlistWatcher {
    pub fn spawn(
        watchlist: Arc<Watchlist>,
        poll_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> io::Result<WatchlistWatcher> {
        let handle = thread::Builder::new()
            .name("watchlist-watcher".to_string())
            .spawn(move || watch_loop(&watchlist, poll_interval, &shutdown))?;
        Ok(WatchlistWatcher { handle })
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("watchlist watcher thread panicked");
        }
    }
}

fn watch_loop(watchlist: &Watchlist, poll_interval: Duration, shutdown: &ShutdownSignal) {
    let (tx, rx) = mpsc::channel::<()>();
    // must outlive the loop or notifications stop
    let _notifier = start_notifier(watchlist.path(), tx);

    while !shutdown.is_triggered() {
        match rx.recv_timeout(poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if shutdown.sleep(poll_interval) {
                    break;
                }
            }
        }
        // coalesce bursts of events from one save
        while rx.try_recv().is_ok() {}

        // malformed content was already logged by the reload
        if let Err(e @ WatchlistError::Io { .. }) = watchlist.check_for_changes() {
            debug!("watchlist check skipped: {}", e);
        }
    }
}

fn start_notifier(path: &Path, tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let created = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    });

    match created {
        Ok(mut watcher) => match watcher.watch(&dir, RecursiveMode::NonRecursive) {
            Ok(()) => Some(watcher),
            Err(e) => {
                warn!("cannot watch {} ({}); polling only", dir.display(), e);
                None
            }
        },
        Err(e) => {
            warn!("file notifications unavailable ({}); polling only", e);
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
