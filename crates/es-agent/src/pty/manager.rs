//! Terminal session multiplexer
//!
//! Keeps the live sessions keyed by the server-assigned session key. At
//! most one session exists per key: opening an existing key closes the
//! old shell first. A per-session watcher reaps the shell when it exits on
//! its own and drops its entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use portable_pty::Child;
use tokio::sync::mpsc;

use es_core::SessionError;
use es_protocol::{SessionKey, TerminalSize};

use super::session::{ShellSpec, SpawnedSession, TerminalOutput, TerminalSession};

type SessionMap = HashMap<SessionKey, Arc<TerminalSession>>;

/// Live terminal sessions by key
pub struct SessionMultiplexer {
    sessions: Arc<Mutex<SessionMap>>,
    shell: ShellSpec,
    initial_size: TerminalSize,
}

impl SessionMultiplexer {
    pub fn new(shell: ShellSpec) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shell,
            initial_size: TerminalSize::default(),
        }
    }

    pub fn shell(&self) -> &ShellSpec {
        &self.shell
    }

    /// Start a shell for `key`, replacing any session already under it.
    ///
    /// Output chunks are sent to `output` until the shell exits or the
    /// session is closed.
    pub fn open(
        &self,
        key: SessionKey,
        output: mpsc::Sender<TerminalOutput>,
    ) -> Result<Arc<TerminalSession>, SessionError> {
        let mut sessions = self.lock();

        if let Some(existing) = sessions.remove(&key) {
            tracing::info!(session = %key, "replacing existing terminal session");
            existing.close();
        }

        let SpawnedSession { session, child } =
            TerminalSession::spawn(key.clone(), &self.shell, self.initial_size, output)?;
        sessions.insert(key, Arc::clone(&session));
        drop(sessions);

        self.watch_exit(Arc::clone(&session), child);
        Ok(session)
    }

    /// Write raw input to the session under `key`
    pub fn write(&self, key: &SessionKey, data: &[u8]) -> Result<(), SessionError> {
        self.get(key)?.write(data)
    }

    pub fn resize(&self, key: &SessionKey, size: TerminalSize) -> Result<(), SessionError> {
        self.get(key)?.resize(size)
    }

    /// Close the session under `key`. Unknown keys are ignored.
    pub fn close(&self, key: &SessionKey) -> bool {
        let removed = self.lock().remove(key);
        match removed {
            Some(session) => session.close(),
            None => {
                tracing::debug!(session = %key, "close for unknown terminal session");
                false
            }
        }
    }

    /// Close every session and empty the map; returns how many were live
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().map(|(_, s)| s).collect();
        let count = drained.len();
        for session in drained {
            session.close();
        }
        if count > 0 {
            tracing::info!(count, "closed all terminal sessions");
        }
        count
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn get(&self, key: &SessionKey) -> Result<Arc<TerminalSession>, SessionError> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(key.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, SessionMap> {
        lock_map(&self.sessions)
    }

    /// Reap the shell on a blocking thread. Only the entry that still
    /// points at this session is removed, so a replacement opened under
    /// the same key survives the old shell's exit.
    fn watch_exit(&self, session: Arc<TerminalSession>, mut child: Box<dyn Child + Send + Sync>) {
        let sessions = Arc::clone(&self.sessions);
        tokio::task::spawn_blocking(move || {
            match child.wait() {
                Ok(status) => tracing::info!(
                    session = %session.key(),
                    exit_code = status.exit_code(),
                    "shell exited"
                ),
                Err(e) => tracing::warn!(session = %session.key(), error = %e, "wait on shell failed"),
            }

            session.close();

            let mut map = lock_map(&sessions);
            if map
                .get(session.key())
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                map.remove(session.key());
            }
        });
    }
}

fn lock_map(sessions: &Mutex<SessionMap>) -> MutexGuard<'_, SessionMap> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for SessionMultiplexer {
    fn drop(&mut self) {
        self.close_all();
    }
}
