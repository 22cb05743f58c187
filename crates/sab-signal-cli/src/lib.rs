//! signal-cli transport adapter.
//!
//! Pulls envelopes with `signal-cli --output=json receive` (one JSON envelope
//! per stdout line) and pushes replies with `signal-cli send`. Replies are
//! italicized over their full length and carry quote flags when the dispatch
//! loop asks for them.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use sab_core::{
    config::Config,
    envelope::SignalMessage,
    errors::Error,
    transport::{Quote, Recipient, SignalTransport},
    Result,
};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Mutex,
    time::timeout,
};
use tracing::{debug, warn};

const STDERR_TAIL_MAX_BYTES: usize = 8 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 100;

/// signal-cli keeps its own chatter on stderr; keep a bounded tail of it for
/// error context without letting a noisy run grow unbounded.
#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Transport implementation that shells out to signal-cli.
#[derive(Clone, Debug)]
pub struct SignalCliTransport {
    program: PathBuf,
    account: Option<String>,
    invocation_timeout: Duration,
}

impl SignalCliTransport {
    pub fn new(program: PathBuf, account: Option<String>, invocation_timeout: Duration) -> Self {
        Self {
            program,
            account,
            invocation_timeout,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.signal_cli_path.clone(),
            cfg.signal_account.clone(),
            cfg.signal_timeout,
        )
    }

    fn receive_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(
            [
                "--output=json",
                "receive",
                "--ignore-attachments",
                "--ignore-stories",
            ]
            .map(String::from),
        );
        args
    }

    fn send_args(&self, recipient: &Recipient, text: &str, quote: Option<&Quote>) -> Vec<String> {
        let mut args = self.base_args();
        args.push("send".to_string());
        if let Recipient::Group(group_id) = recipient {
            args.push("-g".to_string());
            args.push(group_id.clone());
        }
        args.push("-m".to_string());
        args.push(text.to_string());
        args.push("--text-style".to_string());
        args.push(full_italic_style(text));

        if let Some(quote) = quote {
            if quote.timestamp > 0 && !quote.author.is_empty() {
                args.push("--quote-timestamp".to_string());
                args.push(quote.timestamp.to_string());
                args.push("--quote-author".to_string());
                args.push(quote.author.clone());
            }
        }

        // Direct sends take the recipient as the final argument.
        if let Recipient::Direct(number) = recipient {
            args.push(number.clone());
        }
        args
    }

    fn base_args(&self) -> Vec<String> {
        match &self.account {
            Some(account) => vec!["-a".to_string(), account.clone()],
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl SignalTransport for SignalCliTransport {
    async fn receive(&self) -> Result<Vec<SignalMessage>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.receive_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::TransportPull(format!("failed to spawn {}: {e}", self.program.display()))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            Error::TransportPull("signal-cli stdout was not captured".to_string())
        })?;
        let stderr = child.stderr.take();
        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));

        // Drain stderr in the background to avoid blocking on a full pipe.
        if let Some(stderr) = stderr {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tail.lock().await.push_line(line);
                }
            });
        }

        let drain = async {
            let mut messages = Vec::new();
            let mut reader = BufReader::new(stdout).lines();
            loop {
                let line = reader.next_line().await.map_err(|e| {
                    Error::TransportPull(format!("signal-cli stdout read failed: {e}"))
                })?;
                let Some(line) = line else {
                    break;
                };
                if let Some(message) = parse_line(&line) {
                    messages.push(message);
                }
            }
            let status = child.wait().await.map_err(|e| {
                Error::TransportPull(format!("failed to wait for signal-cli: {e}"))
            })?;
            Ok::<_, Error>((messages, status))
        };

        // The child is killed on drop, so a timeout here does not leak it.
        let (messages, status) = match timeout(self.invocation_timeout, drain).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::TransportPull(format!(
                    "signal-cli receive timed out after {:?}",
                    self.invocation_timeout
                )));
            }
        };

        if !status.success() {
            let tail = stderr_tail.lock().await.snapshot();
            if tail.trim().is_empty() {
                return Err(Error::TransportPull(format!(
                    "signal-cli receive exited with {status}"
                )));
            }
            return Err(Error::TransportPull(format!(
                "signal-cli receive exited with {status}\nstderr (tail):\n{tail}"
            )));
        }

        Ok(messages)
    }

    async fn send(&self, recipient: &Recipient, text: &str, quote: Option<&Quote>) -> Result<()> {
        let args = self.send_args(recipient, text, quote);
        debug!("executing: {} {}", self.program.display(), args.join(" "));

        let run = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match timeout(self.invocation_timeout, run).await {
            Ok(result) => result.map_err(|e| {
                Error::TransportPush(format!("failed to run {}: {e}", self.program.display()))
            })?,
            Err(_) => {
                return Err(Error::TransportPush(format!(
                    "signal-cli send timed out after {:?}",
                    self.invocation_timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::TransportPush(format!(
                "signal-cli send to {recipient:?} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// One stdout line → one envelope. Blank lines and lines signal-cli prints
/// that are not JSON envelopes are skipped with a warning, matching the
/// tolerance the receive loop needs for mixed output.
fn parse_line(line: &str) -> Option<SignalMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!("skipping unparseable envelope line: {err}");
            None
        }
    }
}

/// signal-cli text-style span covering the whole message: `0:<len>:ITALIC`.
fn full_italic_style(text: &str) -> String {
    format!("0:{}:ITALIC", text.len())
}
