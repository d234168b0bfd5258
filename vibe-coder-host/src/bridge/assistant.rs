//! Supervised assistant process (spec.md §4.3, "Assistant supervision").
//!
//! The bridge never execs a shell — only the configured assistant binary,
//! inside a pseudo-terminal, with a fixed window size and a controlled
//! environment. PTY I/O is blocking (`portable_pty`'s own contract), so the
//! reader lives on its own OS thread and forwards chunks into a
//! `tokio::sync::broadcast` channel that async callers subscribe to — the
//! same reader-thread-plus-channel shape as the teacher's terminal
//! emulator, adapted from a line-buffered `Vec` of `TerminalLine` to a
//! broadcast of output chunks since here the consumer is a data channel,
//! not a redraw loop.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use portable_pty::{Child, CommandBuilder, NativePtySystem, PtySize, PtySystem};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::timeout;

const PTY_COLS: u16 = 120;
const PTY_ROWS: u16 = 30;
const IDLE_COMPLETION_SECS: u64 = 2;
const READY_FALLBACK_MS: u64 = 500;
const READER_CHUNK_SIZE: usize = 4096;

/// Heuristic marker the assistant prints at its input prompt. Used both to
/// detect readiness at spawn and completion of a running command.
const PROMPT_MARKER: &str = "\u{276f} ";

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("failed to open pty: {0}")]
    OpenPty(String),
    #[error("failed to spawn assistant process: {0}")]
    Spawn(String),
    #[error("assistant process has exited")]
    Exited,
    #[error("write to assistant pty failed: {0}")]
    Write(String),
    #[error("a command is already running for this session")]
    Busy,
}

#[derive(Debug, Clone)]
pub enum AssistantEvent {
    Output(String),
    Error(String),
    Exited,
}

/// One assistant process, attached to a session (or shared as a singleton
/// — see `HostConfig::assistant_mode`).
pub struct AssistantSession {
    pub session_id: String,
    writer: StdMutex<Box<dyn Write + Send>>,
    child: StdMutex<Box<dyn Child + Send + Sync>>,
    events: broadcast::Sender<AssistantEvent>,
    ready: Arc<AtomicBool>,
    destroyed: AtomicBool,
    last_activity: AtomicI64,
    /// Set for the duration of a `run_command` call so a second inbound
    /// command is rejected with `Busy` (spec.md §7's 409) instead of being
    /// interleaved into the same pty.
    running: AtomicBool,
    /// Checked once per idle tick inside `run_command`'s collection loop;
    /// `cancel` sets it to unwind a running command early.
    cancel_requested: AtomicBool,
}

impl AssistantSession {
    /// Spawn the assistant binary in a 120x30 pty with a deterministic
    /// environment, and wait for readiness: either the prompt marker
    /// appears in early output, or a 500ms fallback elapses.
    pub async fn spawn(
        session_id: String,
        assistant_bin: &str,
        workspace: &str,
    ) -> Result<Self, AssistantError> {
        let pty_system = NativePtySystem::default();
        let pair = pty_system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AssistantError::OpenPty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(assistant_bin);
        cmd.cwd(workspace);
        cmd.env("HOME", workspace);
        cmd.env("USER", "vibe-coder");
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AssistantError::Spawn(e.to_string()))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AssistantError::OpenPty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AssistantError::OpenPty(e.to_string()))?;

        let (events_tx, _) = broadcast::channel(256);
        let ready = Arc::new(AtomicBool::new(false));
        let ready_writer = Arc::clone(&ready);
        let events_for_reader = events_tx.clone();

        std::thread::spawn(move || read_loop(reader, events_for_reader, ready_writer));

        let session = Self {
            session_id,
            writer: StdMutex::new(writer),
            child: StdMutex::new(child),
            events: events_tx,
            ready,
            destroyed: AtomicBool::new(false),
            last_activity: AtomicI64::new(Utc::now().timestamp()),
            running: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        };

        // Readiness: prompt marker or a 500ms fallback, whichever first.
        let mut rx = session.events.subscribe();
        let _ = timeout(Duration::from_millis(READY_FALLBACK_MS), async {
            while !session.ready.load(Ordering::SeqCst) {
                match rx.recv().await {
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        })
        .await;
        session.ready.store(true, Ordering::SeqCst);

        Ok(session)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssistantEvent> {
        self.events.subscribe()
    }

    pub fn touch(&self) {
        self.last_activity.store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    pub fn idle_for(&self) -> i64 {
        Utc::now().timestamp() - self.last_activity.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask a running command to wind down early. Checked once per idle
    /// tick in `run_command`; has no effect if nothing is running.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    fn write_line(&self, text: &str) -> Result<(), AssistantError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(AssistantError::Exited);
        }
        let mut writer = self.writer.lock().expect("pty writer mutex poisoned");
        writer
            .write_all(text.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush())
            .map_err(|e| AssistantError::Write(e.to_string()))
    }

    /// Forward raw keystrokes to the pty verbatim (the `key-input` data
    /// channel variant — no trailing newline appended).
    pub fn write_raw(&self, data: &str) -> Result<(), AssistantError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(AssistantError::Exited);
        }
        let mut writer = self.writer.lock().expect("pty writer mutex poisoned");
        writer
            .write_all(data.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| AssistantError::Write(e.to_string()))
    }

    /// Run one command to completion: write it to the pty, then collect
    /// output until the prompt reappears, `IDLE_COMPLETION_SECS` passes
    /// with no new output, or a cancellation request arrives, subject to
    /// an overall `command_timeout`. Only one command may run at a time
    /// per session — a second call while one is in flight is rejected with
    /// [`AssistantError::Busy`] (spec.md §7, 409).
    pub async fn run_command(
        &self,
        command: &str,
        command_timeout: Duration,
    ) -> Result<Vec<String>, AssistantError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AssistantError::Busy);
        }
        let result = self.run_command_inner(command, command_timeout).await;
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_command_inner(
        &self,
        command: &str,
        command_timeout: Duration,
    ) -> Result<Vec<String>, AssistantError> {
        self.touch();
        let mut rx = self.events.subscribe();
        self.write_line(command)?;

        let mut chunks = Vec::new();
        let deadline = tokio::time::Instant::now() + command_timeout;

        loop {
            if self.cancel_requested.load(Ordering::SeqCst) {
                break;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let idle_budget = Duration::from_secs(IDLE_COMPLETION_SECS).min(remaining);

            match timeout(idle_budget, rx.recv()).await {
                Ok(Ok(AssistantEvent::Output(chunk))) => {
                    let saw_prompt = chunk.contains(PROMPT_MARKER);
                    chunks.push(chunk);
                    if saw_prompt {
                        break;
                    }
                }
                Ok(Ok(AssistantEvent::Error(err))) => {
                    chunks.push(format!("[assistant error] {err}"));
                }
                Ok(Ok(AssistantEvent::Exited)) => {
                    self.destroyed.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(Err(_lagged_or_closed)) => break,
                Err(_idle_elapsed) => break,
            }
        }

        Ok(chunks)
    }

    /// `/exit`: forward to the assistant, wait up to 5s for process exit,
    /// SIGTERM on timeout.
    pub async fn exit(&self) {
        let _ = self.write_line("/exit");
        let mut rx = self.events.subscribe();
        let exited = timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(AssistantEvent::Exited) => return,
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        })
        .await
        .is_ok();

        if !exited {
            let mut child = self.child.lock().expect("child mutex poisoned");
            let _ = child.kill();
        }
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    events: broadcast::Sender<AssistantEvent>,
    ready: Arc<AtomicBool>,
) {
    let mut buf = [0u8; READER_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                let _ = events.send(AssistantEvent::Exited);
                break;
            }
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                if text.contains(PROMPT_MARKER) {
                    ready.store(true, Ordering::SeqCst);
                }
                let _ = events.send(AssistantEvent::Output(text));
            }
            Err(e) => {
                let _ = events.send(AssistantEvent::Error(e.to_string()));
                break;
            }
        }
    }
}
