use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use tracing::warn;
use uuid::Uuid;

/// Session-scoped storage for the broker client identity. The identity
/// survives reconnects and is only dropped when the session ends.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn store(&self, client_id: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

pub fn load_or_mint_client_id(store: &dyn SessionStore, prefix: &str) -> String {
    if let Some(existing) = store.load() {
        return existing;
    }
    let minted = format!("{prefix}{}", Uuid::new_v4().simple());
    if let Err(err) = store.store(&minted) {
        warn!(error = %err, "channel: failed to persist client identity; reconnects in this process still reuse it");
    }
    minted
}

#[derive(Default)]
pub struct MemorySessionStore {
    client_id: Mutex<Option<String>>,
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<String> {
        self.client_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store(&self, client_id: &str) -> Result<()> {
        *self
            .client_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(client_id.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.client_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        Ok(())
    }
}

/// Keeps the identity in a small file so a restarted CLI in the same
/// operator session resumes the same broker session.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Option<String> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    fn store(&self, client_id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create session directory '{}'", parent.display())
            })?;
        }
        fs::write(&self.path, client_id)
            .with_context(|| format!("failed to write session file '{}'", self.path.display()))
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove session file '{}'", self.path.display())
            }),
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
