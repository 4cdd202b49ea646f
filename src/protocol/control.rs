//! Tor control-port session
//!
//! One session per operation: connect, authenticate, run the command,
//! `QUIT`, close. Every read and write is bounded by the session timeout,
//! and replies are read in full (including slow or fragmented ones) before
//! the next command goes out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use zeroize::Zeroizing;

use super::reply::{LineKind, Reply, ReplyLine};
use crate::error::{HaError, Result};

/// Longest reply line accepted before the session is considered broken
const MAX_LINE_LEN: usize = 64 * 1024;

/// Credentials for `AUTHENTICATE`
#[derive(Clone)]
pub enum ControlAuth {
    /// `AUTHENTICATE` with no argument (no auth configured on the daemon)
    Null,
    /// Quoted password
    Password(Zeroizing<String>),
    /// Hex-encoded contents of the control auth cookie
    Cookie(PathBuf),
}

impl std::fmt::Debug for ControlAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlAuth::Null => f.write_str("Null"),
            ControlAuth::Password(_) => f.write_str("Password(<redacted>)"),
            ControlAuth::Cookie(path) => f.debug_tuple("Cookie").field(path).finish(),
        }
    }
}

impl ControlAuth {
    /// Pick credentials from config: password wins over cookie
    pub fn from_config(password: Option<&str>, cookie_path: Option<&str>) -> Self {
        match (password, cookie_path) {
            (Some(p), _) => ControlAuth::Password(Zeroizing::new(p.to_string())),
            (None, Some(path)) => ControlAuth::Cookie(PathBuf::from(path)),
            (None, None) => ControlAuth::Null,
        }
    }

    async fn command(&self) -> Result<Zeroizing<String>> {
        match self {
            ControlAuth::Null => Ok(Zeroizing::new("AUTHENTICATE".to_string())),
            ControlAuth::Password(password) => Ok(Zeroizing::new(format!(
                "AUTHENTICATE \"{}\"",
                escape_quoted(password)
            ))),
            ControlAuth::Cookie(path) => {
                let cookie = Zeroizing::new(tokio::fs::read(path).await.map_err(|e| {
                    HaError::ControlAuthFailed(format!(
                        "cannot read cookie {}: {}",
                        path.display(),
                        e
                    ))
                })?);
                Ok(Zeroizing::new(format!(
                    "AUTHENTICATE {}",
                    hex::encode(cookie.as_slice())
                )))
            }
        }
    }
}

/// Escape a value for a control-protocol quoted string
fn escape_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// An open control-port session
pub struct ControlSession<S> {
    stream: BufReader<S>,
    timeout: Duration,
}

impl ControlSession<TcpStream> {
    /// Open a TCP session to the control port
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HaError::timeout(format!("control connect to {}", addr), timeout))?
            .map_err(|e| HaError::ProxyUnreachable {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        log::debug!("Opened control session to {}", addr);
        Ok(Self::new(stream, timeout))
    }
}

impl<S> ControlSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-connected stream
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            timeout,
        }
    }

    /// Authenticate, failing with `ControlAuthFailed` on any non-2xx reply
    pub async fn authenticate(&mut self, auth: &ControlAuth) -> Result<()> {
        let command = auth.command().await?;
        let reply = self.send_raw(&command).await?;

        if !reply.is_ok() {
            return Err(HaError::ControlAuthFailed(reply.summary()));
        }

        log::debug!("Control session authenticated");
        Ok(())
    }

    /// Send `SIGNAL <name>`
    pub async fn signal(&mut self, name: &str) -> Result<()> {
        let command = format!("SIGNAL {}", name);
        self.send(&command).await.map(|_| ())
    }

    /// Send `GETINFO <keys...>` and return the key/value pairs
    pub async fn get_info(&mut self, keys: &[&str]) -> Result<HashMap<String, String>> {
        let command = format!("GETINFO {}", keys.join(" "));
        let reply = self.send(&command).await?;
        Ok(reply.values())
    }

    /// Send a command and require a 2xx reply
    pub async fn send(&mut self, command: &str) -> Result<Reply> {
        self.send_raw(command).await?.into_result(command)
    }

    /// End the session with `QUIT` and close the stream
    ///
    /// Tor answers `250 closing connection`; a missing answer is not an error.
    pub async fn quit(mut self) -> Result<()> {
        self.write_line("QUIT").await?;
        if let Err(e) = self.read_reply().await {
            log::debug!("No reply to QUIT: {}", e);
        }
        let _ = self.stream.get_mut().shutdown().await;
        Ok(())
    }

    async fn send_raw(&mut self, command: &str) -> Result<Reply> {
        self.write_line(command).await?;
        self.read_reply().await
    }

    async fn write_line(&mut self, command: &str) -> Result<()> {
        let timeout = self.timeout;
        let mut line = Zeroizing::new(String::with_capacity(command.len() + 2));
        line.push_str(command);
        line.push_str("\r\n");

        let stream = self.stream.get_mut();
        tokio::time::timeout(timeout, async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| HaError::timeout("control write", timeout))??;
        Ok(())
    }

    /// Read lines until an end line (`NNN `) arrives
    async fn read_reply(&mut self) -> Result<Reply> {
        let mut reply = Reply::default();

        loop {
            let raw = self.read_line().await?;
            let mut line = ReplyLine::parse(&raw)?;

            match line.kind {
                LineKind::Data => {
                    line.data = self.read_data_block().await?;
                    reply.lines.push(line);
                }
                LineKind::Mid => reply.lines.push(line),
                LineKind::End => {
                    reply.lines.push(line);
                    return Ok(reply);
                }
            }
        }
    }

    /// Read a dot-terminated data block
    async fn read_data_block(&mut self) -> Result<Vec<String>> {
        let mut data = Vec::new();
        loop {
            let raw = self.read_line().await?;
            if raw == "." {
                return Ok(data);
            }
            // Leading dots are doubled on the wire
            let unescaped = raw.strip_prefix('.').map(str::to_string).unwrap_or(raw);
            data.push(unescaped);
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let timeout = self.timeout;
        let mut buf = String::new();
        // One byte past the cap tells an overlong line from one that fits
        let mut limited = (&mut self.stream).take(MAX_LINE_LEN as u64 + 1);

        let n = tokio::time::timeout(timeout, limited.read_line(&mut buf))
            .await
            .map_err(|_| HaError::timeout("control read", timeout))??;

        if n == 0 {
            return Err(HaError::ControlProtocol(
                "control connection closed mid-reply".into(),
            ));
        }
        if buf.len() > MAX_LINE_LEN {
            return Err(HaError::ControlProtocol("reply line too long".into()));
        }

        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }
}
