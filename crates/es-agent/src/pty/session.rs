//! A single interactive shell on a pseudo-terminal

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use es_core::SessionError;
use es_protocol::{SessionKey, TerminalSize};

/// Bytes read from the pseudo-terminal per chunk
const READ_BUFFER_SIZE: usize = 4096;

/// Shell program and environment for new sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSpec {
    pub program: String,
    pub env: Vec<(String, String)>,
}

impl ShellSpec {
    /// Pick the shell: `configured`, then `$SHELL`, then bash, then sh.
    /// `TERM=xterm-256color` is always set unless `env` overrides it.
    pub fn resolve(configured: Option<&str>, env: Vec<(String, String)>) -> Self {
        let program = configured
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| {
                if Path::new("/bin/bash").exists() {
                    "/bin/bash".to_string()
                } else {
                    "/bin/sh".to_string()
                }
            });

        let mut merged = vec![("TERM".to_string(), "xterm-256color".to_string())];
        for (key, value) in env {
            merged.retain(|(k, _)| *k != key);
            merged.push((key, value));
        }

        Self {
            program,
            env: merged,
        }
    }
}

/// A chunk of session output, ready to be pushed as `terminal_output`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalOutput {
    pub key: SessionKey,
    pub data: String,
}

/// Handles released on close
struct SessionIo {
    closed: bool,
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
}

/// One shell running on a pseudo-terminal
pub struct TerminalSession {
    key: SessionKey,
    pid: Option<u32>,
    io: Mutex<SessionIo>,
}

/// A started session plus the child handle its exit watcher waits on
pub(crate) struct SpawnedSession {
    pub session: Arc<TerminalSession>,
    pub child: Box<dyn Child + Send + Sync>,
}

impl TerminalSession {
    /// Start `shell` on a new pseudo-terminal of `size` and begin reading
    /// its output into `output`.
    pub(crate) fn spawn(
        key: SessionKey,
        shell: &ShellSpec,
        size: TerminalSize,
        output: mpsc::Sender<TerminalOutput>,
    ) -> Result<SpawnedSession, SessionError> {
        let PtyPair { master, slave } = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| SessionError::Spawn(format!("open pty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&shell.program);
        for (key, value) in &shell.env {
            cmd.env(key, value);
        }

        let mut child = slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(format!("{}: {}", shell.program, e)))?;
        // The shell owns the slave side now; keeping it open here would
        // stop the reader from ever seeing end-of-file.
        drop(slave);

        let handles = master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, master.take_writer()?)));
        let (reader, writer) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                let _ = child.kill();
                return Err(SessionError::Spawn(format!("pty handles: {}", e)));
            }
        };

        let pid = child.process_id();
        tracing::info!(session = %key, shell = %shell.program, ?pid, "terminal session started");

        let session = Arc::new(Self {
            key: key.clone(),
            pid,
            io: Mutex::new(SessionIo {
                closed: false,
                master: Some(master),
                writer: Some(writer),
                killer: Some(child.clone_killer()),
            }),
        });

        spawn_reader(key, reader, output);

        Ok(SpawnedSession { session, child })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Process id of the shell, where the platform reports one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Feed raw bytes to the shell's input
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut io = self.lock_io();
        if io.closed {
            return Err(SessionError::Closed(self.key.clone()));
        }
        let writer = io
            .writer
            .as_mut()
            .ok_or_else(|| SessionError::Closed(self.key.clone()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        let io = self.lock_io();
        if io.closed {
            return Err(SessionError::Closed(self.key.clone()));
        }
        let master = io
            .master
            .as_ref()
            .ok_or_else(|| SessionError::Closed(self.key.clone()))?;

        tracing::debug!(session = %self.key, cols = size.cols, rows = size.rows, "resizing terminal");
        master
            .resize(pty_size(size))
            .map_err(|e| SessionError::Resize(e.to_string()))
    }

    /// Terminate the shell and release the pseudo-terminal.
    ///
    /// Returns false if the session was already closed.
    pub fn close(&self) -> bool {
        let mut io = self.lock_io();
        if io.closed {
            return false;
        }
        io.closed = true;

        if let Some(mut killer) = io.killer.take() {
            if let Err(e) = killer.kill() {
                // Usually the shell already exited on its own.
                tracing::debug!(session = %self.key, error = %e, "kill shell failed");
            }
        }
        io.writer.take();
        io.master.take();

        tracing::info!(session = %self.key, "terminal session closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock_io().closed
    }

    fn lock_io(&self) -> MutexGuard<'_, SessionIo> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("key", &self.key)
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Read output on a blocking thread until end-of-file, a read error, or
/// the receiving side going away.
fn spawn_reader(
    key: SessionKey,
    mut reader: Box<dyn Read + Send>,
    output: mpsc::Sender<TerminalOutput>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut carry = Vec::new();

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let data = decode_utf8_chunk(&mut carry, &buf[..n]);
                    if data.is_empty() {
                        continue;
                    }
                    let chunk = TerminalOutput {
                        key: key.clone(),
                        data,
                    };
                    if output.blocking_send(chunk).is_err() {
                        tracing::debug!(session = %key, "output receiver dropped");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO once the shell is gone.
                    tracing::debug!(session = %key, error = %e, "pty read ended");
                    break;
                }
            }
        }

        tracing::debug!(session = %key, "pty reader stopped");
    })
}

/// Decode `chunk` prefixed by any bytes held back from the previous call.
///
/// A multi-byte character split across reads is held back in `carry`
/// until its remaining bytes arrive. Bytes that can never form valid UTF-8
/// are replaced with U+FFFD.
pub(crate) fn decode_utf8_chunk(carry: &mut Vec<u8>, chunk: &[u8]) -> String {
    carry.extend_from_slice(chunk);

    let mut out = String::with_capacity(carry.len());
    let mut rest: &[u8] = &carry[..];
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                rest = &[];
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                // valid_up_to guarantees this prefix decodes.
                out.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[bad..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }

    let held = rest.to_vec();
    *carry = held;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_ascii() {
        let mut carry = Vec::new();
        assert_eq!(decode_utf8_chunk(&mut carry, b"ls -la\r\n"), "ls -la\r\n");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_decode_split_multibyte() {
        let bytes = "h\u{e9}llo \u{4e16}".as_bytes();
        // Split inside the three-byte character.
        let (first, second) = bytes.split_at(bytes.len() - 2);

        let mut carry = Vec::new();
        assert_eq!(decode_utf8_chunk(&mut carry, first), "h\u{e9}llo ");
        assert_eq!(carry.len(), 1);
        assert_eq!(decode_utf8_chunk(&mut carry, second), "\u{4e16}");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_decode_invalid_bytes_replaced() {
        let mut carry = Vec::new();
        let out = decode_utf8_chunk(&mut carry, b"a\xffb");
        assert_eq!(out, "a\u{fffd}b");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_shell_resolution() {
        let spec = ShellSpec::resolve(Some("/bin/zsh"), Vec::new());
        assert_eq!(spec.program, "/bin/zsh");
        assert_eq!(
            spec.env,
            [("TERM".to_string(), "xterm-256color".to_string())]
        );

        let spec = ShellSpec::resolve(Some("  "), Vec::new());
        assert!(!spec.program.trim().is_empty());
    }

    #[test]
    fn test_shell_env_overrides_term() {
        let spec = ShellSpec::resolve(
            Some("/bin/sh"),
            vec![
                ("TERM".into(), "vt100".into()),
                ("LANG".into(), "C.UTF-8".into()),
            ],
        );
        assert_eq!(
            spec.env,
            [
                ("TERM".to_string(), "vt100".to_string()),
                ("LANG".to_string(), "C.UTF-8".to_string()),
            ]
        );
    }
}
