//! Web terminal
//!
//! Every connection spawns the configured shell with piped stdio. Client
//! text and binary frames are queued for the shell's stdin line by line and
//! written by a separate task, so stdout and stderr keep flowing back as
//! text frames while the shell is slow to read. There is no PTY, so
//! full-screen and interactive programs are refused before they reach the
//! shell.
//!
//! The child is killed and reaped when the session ends. If the session
//! future is dropped instead (forced close), `kill_on_drop` still kills it.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use taichi_core::{AppError, AppResult, StreamApp, StreamContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Programs that need a PTY or take over the screen
pub const UNSUPPORTED_COMMANDS: &[&str] = &[
    "top", "vim", "ping", "vi", "htop", "nano", "emacs", "ssh", "telnet", "ftp", "sftp", "scp",
    "less", "more", "man", "lynx", "nc", "netcat", "watch", "screen", "tmux", "w3m", "links",
    "elinks", "mysql", "psql", "sqlite3",
];

/// Whether the first word of `line` names an unsupported program
pub fn is_unsupported(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .map(|program| program.rsplit('/').next().unwrap_or(program))
        .is_some_and(|program| UNSUPPORTED_COMMANDS.contains(&program))
}

fn default_shell() -> String {
    "sh".to_string()
}

/// Settings for [`TerminalApp`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSettings {
    /// Program started for each session
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            args: Vec::new(),
        }
    }
}

/// A running terminal session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSession {
    pub connection_id: Uuid,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

type Sessions = Arc<Mutex<HashMap<Uuid, TerminalSession>>>;

/// Removes the session entry however the session ends
struct SessionGuard {
    sessions: Sessions,
    connection_id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions
            .lock()
            .remove(&self.connection_id);
    }
}

/// Relays a shell over a WebSocket
#[derive(Debug, Clone, Default)]
pub struct TerminalApp {
    settings: TerminalSettings,
    sessions: Sessions,
}

impl TerminalApp {
    pub fn new(settings: TerminalSettings) -> Self {
        Self {
            settings,
            sessions: Sessions::default(),
        }
    }

    /// Sessions currently holding a child process
    pub fn sessions(&self) -> Vec<TerminalSession> {
        self.sessions
            .lock()
            .values()
            .cloned()
            .collect()
    }

    fn spawn_shell(&self) -> AppResult<Child> {
        Command::new(&self.settings.shell)
            .args(&self.settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::Stream(format!(
                    "Failed to start shell '{}': {}",
                    self.settings.shell, e
                ))
            })
    }

    fn register(&self, connection_id: Uuid, pid: Option<u32>) -> SessionGuard {
        self.sessions
            .lock()
            .insert(
                connection_id,
                TerminalSession {
                    connection_id,
                    pid,
                    started_at: Utc::now(),
                },
            );
        SessionGuard {
            sessions: Arc::clone(&self.sessions),
            connection_id,
        }
    }
}

#[async_trait]
impl StreamApp for TerminalApp {
    async fn serve(&self, socket: WebSocket, ctx: StreamContext) -> AppResult<()> {
        let (mut sink, stream) = socket.split();

        let mut child = match self.spawn_shell() {
            Ok(child) => child,
            Err(err) => {
                let _ = sink.send(Message::Text(format!("{}\r\n", err).into())).await;
                let _ = sink.close().await;
                return Err(err);
            }
        };
        let pid = child.id();
        let _guard = self.register(ctx.connection_id, pid);
        info!(connection = %ctx.connection_id, pid = ?pid, shell = %self.settings.shell, "Terminal session started");

        let result = relay(&mut child, &mut sink, stream, &ctx).await;

        if let Err(err) = child.start_kill() {
            debug!(connection = %ctx.connection_id, error = %err, "Shell already exited");
        }
        match child.wait().await {
            Ok(status) => {
                info!(connection = %ctx.connection_id, pid = ?pid, %status, "Terminal session ended")
            }
            Err(err) => {
                warn!(connection = %ctx.connection_id, pid = ?pid, error = %err, "Failed to reap shell")
            }
        }
        result
    }
}

type Sink = SplitSink<WebSocket, Message>;
type Lines = VecDeque<Vec<u8>>;

/// Lines queued for the writer task before the relay stops reading the socket
const STDIN_QUEUE: usize = 64;

async fn relay(
    child: &mut Child,
    sink: &mut Sink,
    stream: SplitStream<WebSocket>,
    ctx: &StreamContext,
) -> AppResult<()> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Stream("Shell stdin not captured".to_string()))?;
    let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE);
    let writer = tokio::spawn(write_stdin(stdin, stdin_rx, ctx.connection_id));

    let result = pump(child, sink, stream, stdin_tx, ctx).await;
    writer.abort();
    result
}

/// Feed queued lines to the shell. Ends when the relay drops its sender
/// or the shell stops reading.
async fn write_stdin(mut stdin: ChildStdin, mut lines: mpsc::Receiver<Vec<u8>>, connection_id: Uuid) {
    while let Some(line) = lines.recv().await {
        let written = match stdin.write_all(&line).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            debug!(connection = %connection_id, error = %err, "Shell stdin closed");
            return;
        }
    }
}

async fn pump(
    child: &mut Child,
    sink: &mut Sink,
    mut stream: SplitStream<WebSocket>,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    ctx: &StreamContext,
) -> AppResult<()> {
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Stream("Shell stdout not captured".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Stream("Shell stderr not captured".to_string()))?;

    let mut stdin_tx = Some(stdin_tx);
    let mut pending = Lines::new();
    let mut out_pipe = OutputPipe::new();
    let mut err_pipe = OutputPipe::new();

    while out_pipe.open || err_pipe.open {
        // The socket is not read while lines wait for the writer, so a shell
        // that reads slowly pushes back on the client.
        tokio::select! {
            biased;
            _ = ctx.draining() => return close_away(sink).await,
            queued = queue_line(&stdin_tx, &mut pending), if !pending.is_empty() => {
                if !queued {
                    stdin_tx = None;
                    pending.clear();
                }
            }
            incoming = stream.next(), if pending.is_empty() => match incoming {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(Message::Text(text))) => {
                    forward(sink, &mut pending, text.as_str(), stdin_tx.is_some()).await?
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes);
                    forward(sink, &mut pending, &text, stdin_tx.is_some()).await?
                }
                Some(Ok(_)) => {}
            },
            read = stdout.read(&mut out_pipe.buf), if out_pipe.open => out_pipe.relay(sink, read).await?,
            read = stderr.read(&mut err_pipe.buf), if err_pipe.open => err_pipe.relay(sink, read).await?,
        }
    }

    // Both pipes are closed; closing stdin lets a shell waiting on input exit.
    drop(stdin_tx);
    let status = tokio::select! {
        biased;
        _ = ctx.draining() => return close_away(sink).await,
        ended = peer_closed(&mut stream) => return ended,
        status = child.wait() => status?,
    };

    let notice = format!("[process exited: {}]\r\n", status);
    sink.send(Message::Text(notice.into())).await?;
    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static("shell exited"),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    Ok(())
}

/// Hand the oldest pending line to the writer task; `false` once the
/// writer is gone.
async fn queue_line(tx: &Option<mpsc::Sender<Vec<u8>>>, pending: &mut Lines) -> bool {
    let Some(tx) = tx else {
        return false;
    };
    match tx.reserve().await {
        Ok(permit) => {
            if let Some(line) = pending.pop_front() {
                permit.send(line);
            }
            true
        }
        Err(_) => false,
    }
}

async fn close_away(sink: &mut Sink) -> AppResult<()> {
    let frame = CloseFrame {
        code: close_code::AWAY,
        reason: Utf8Bytes::from_static("server shutting down"),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    Ok(())
}

/// Resolves once the client goes away, discarding its input.
async fn peer_closed(stream: &mut SplitStream<WebSocket>) -> AppResult<()> {
    loop {
        match stream.next().await {
            None | Some(Ok(Message::Close(_))) => return Ok(()),
            Some(Err(err)) => return Err(err.into()),
            Some(Ok(_)) => {}
        }
    }
}

/// One of the shell's output pipes
struct OutputPipe {
    buf: Vec<u8>,
    decoder: Utf8Decoder,
    open: bool,
}

impl OutputPipe {
    fn new() -> Self {
        Self {
            buf: vec![0u8; 4096],
            decoder: Utf8Decoder::default(),
            open: true,
        }
    }

    /// Send what was read. End of file closes the pipe and flushes any
    /// held-back partial character.
    async fn relay(&mut self, sink: &mut Sink, read: std::io::Result<usize>) -> AppResult<()> {
        let text = match read? {
            0 => {
                self.open = false;
                self.decoder.finish()
            }
            n => self.decoder.decode(&self.buf[..n]),
        };
        if !text.is_empty() {
            sink.send(Message::Text(text.into())).await?;
        }
        Ok(())
    }
}

/// UTF-8 decoding across read boundaries.
///
/// An incomplete sequence at the end of a chunk is held until the next one.
/// Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.carry.extend_from_slice(chunk);
        let mut text = String::with_capacity(self.carry.len());
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.carry.clear();
                    return text;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.carry[..valid]));
                    match err.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.carry.drain(..valid + invalid);
                        }
                        None => {
                            self.carry.drain(..valid);
                            return text;
                        }
                    }
                }
            }
        }
    }

    /// Whatever is still held, decoded lossily
    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        text
    }
}

/// Queue client input for the shell, one line at a time. Unsupported
/// programs are answered directly and never reach the shell.
async fn forward(sink: &mut Sink, pending: &mut Lines, input: &str, stdin_open: bool) -> AppResult<()> {
    for line in input.lines() {
        if is_unsupported(line) {
            let program = line.split_whitespace().next().unwrap_or_default();
            let reply = format!("Unsupported command: {}\r\n", program);
            sink.send(Message::Text(reply.into())).await?;
            continue;
        }
        if stdin_open {
            let mut buf = Vec::with_capacity(line.len() + 1);
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
            pending.push_back(buf);
        }
    }
    Ok(())
}
