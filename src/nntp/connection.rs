//! One NNTP session: handshake, group selection, body fetch
//!
//! The protocol surface is deliberately small. A connection performs the
//! greeting, MODE READER, and AUTHINFO exchange once, then loops on
//! GROUP/BODY for segment fetches with DATE as an anti-idle ping. Responses
//! are single-line except BODY's 222, which is followed by a dot-terminated
//! multiline block with RFC 3977 dot-stuffing.

use crate::config::ServerConfig;
use crate::error::NntpError;
use crate::speed_limiter::SpeedLimiter;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A parsed single-line NNTP response
#[derive(Debug)]
pub struct Response {
    /// Three-digit status code
    pub code: u16,
    /// Text after the code
    pub text: String,
}

/// One authenticated NNTP session
pub struct NntpConnection {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
    limiter: SpeedLimiter,
    /// Abort a read when no data arrives for this long
    active_timeout: Duration,
    current_group: Option<String>,
}

impl NntpConnection {
    /// Open a TCP connection to `server`, read the greeting, switch to reader
    /// mode, and authenticate when credentials are configured.
    pub async fn connect(
        server: &ServerConfig,
        limiter: SpeedLimiter,
        active_timeout: Duration,
    ) -> Result<Self, NntpError> {
        let stream = Self::open_stream(server).await?;
        stream.set_nodelay(true).map_err(NntpError::Io)?;

        let (read_half, write_half) = stream.into_split();
        let mut conn = Self::from_parts(
            Box::new(read_half),
            Box::new(write_half),
            limiter,
            active_timeout,
        );
        conn.handshake(server).await?;
        Ok(conn)
    }

    async fn open_stream(server: &ServerConfig) -> Result<TcpStream, NntpError> {
        let addr = format!("{}:{}", server.host, server.port);
        let connect_failed = |reason: String| NntpError::ConnectFailed {
            host: server.host.clone(),
            port: server.port,
            reason,
        };

        let connect = async {
            match &server.bind_address {
                None => TcpStream::connect(&addr).await,
                Some(local) => {
                    // Binding requires resolving the target ourselves
                    let remote = lookup_host(&addr)
                        .await?
                        .next()
                        .ok_or_else(|| std::io::Error::other("host resolved to no addresses"))?;
                    let socket = if remote.is_ipv4() {
                        TcpSocket::new_v4()?
                    } else {
                        TcpSocket::new_v6()?
                    };
                    let local_addr = local
                        .parse()
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                    socket.bind(local_addr)?;
                    socket.connect(remote).await
                }
            }
        };

        timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| NntpError::Timeout {
                seconds: CONNECT_TIMEOUT.as_secs(),
            })?
            .map_err(|e| connect_failed(e.to_string()))
    }

    fn from_parts(
        reader: Box<dyn AsyncRead + Unpin + Send>,
        writer: Box<dyn AsyncWrite + Unpin + Send>,
        limiter: SpeedLimiter,
        active_timeout: Duration,
    ) -> Self {
        Self {
            writer,
            reader: BufReader::with_capacity(64 * 1024, reader),
            limiter,
            active_timeout,
            current_group: None,
        }
    }

    async fn handshake(&mut self, server: &ServerConfig) -> Result<(), NntpError> {
        let greeting = self.read_response().await?;
        if greeting.code != 200 && greeting.code != 201 {
            return Err(NntpError::UnexpectedResponse {
                command: "greeting".to_string(),
                code: greeting.code,
                message: greeting.text,
            });
        }

        // 201 after MODE READER just means posting is disallowed
        let mode = self.exchange("MODE READER").await?;
        if mode.code != 200 && mode.code != 201 {
            return Err(NntpError::ModeRejected {
                code: mode.code,
                message: mode.text,
            });
        }

        if let Some(username) = &server.username {
            let user = self.exchange(&format!("AUTHINFO USER {username}")).await?;
            match user.code {
                281 => {}
                381 => {
                    let password = server.password.as_deref().unwrap_or("");
                    let pass = self.exchange(&format!("AUTHINFO PASS {password}")).await?;
                    if pass.code != 281 {
                        return Err(NntpError::AuthRejected {
                            code: pass.code,
                            // Code only; the text may echo credentials
                            message: "password rejected".to_string(),
                        });
                    }
                }
                code => {
                    return Err(NntpError::AuthRejected {
                        code,
                        message: "username rejected".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Select one of `groups`, preferring the already-selected one.
    ///
    /// Tries each group in order; succeeds on the first 211. Fails with
    /// [`NntpError::GroupUnavailable`] only when the server rejected every
    /// group with a definitive code (this server cannot carry the file).
    pub async fn select_group(&mut self, groups: &[String]) -> Result<(), NntpError> {
        if let Some(current) = &self.current_group
            && groups.iter().any(|g| g == current)
        {
            return Ok(());
        }

        let mut last: Option<(String, u16)> = None;
        for group in groups {
            let response = self.exchange(&format!("GROUP {group}")).await?;
            if response.code == 211 {
                self.current_group = Some(group.clone());
                return Ok(());
            }
            tracing::debug!(group = %group, code = response.code, "group rejected");
            last = Some((group.clone(), response.code));
        }

        let (group, code) = last.unwrap_or((String::new(), 0));
        Err(NntpError::GroupUnavailable { group, code })
    }

    /// Fetch an article body by message-id.
    ///
    /// Returns the dot-unstuffed body with lines normalized to `\n`, plus the
    /// raw byte count read off the wire (for progress accounting).
    pub async fn fetch_body(&mut self, message_id: &str) -> Result<(Vec<u8>, u64), NntpError> {
        let response = self.exchange(&format!("BODY <{message_id}>")).await?;
        match response.code {
            222 => self.read_body().await,
            430 | 423 => Err(NntpError::ArticleMissing {
                message_id: message_id.to_string(),
                code: response.code,
            }),
            code => Err(NntpError::UnexpectedResponse {
                command: "BODY".to_string(),
                code,
                message: response.text,
            }),
        }
    }

    /// Read the multiline block after a 222 until the lone-dot terminator
    async fn read_body(&mut self) -> Result<(Vec<u8>, u64), NntpError> {
        let mut body = Vec::with_capacity(1024 * 1024);
        let mut line = Vec::new();
        let mut read_bytes = 0u64;

        loop {
            line.clear();
            let n = self.read_line_raw(&mut line).await?;
            if n == 0 {
                return Err(NntpError::Disconnected);
            }
            read_bytes += n as u64;
            self.limiter.acquire(n as u64).await;

            if line == b".\r\n" || line == b".\n" {
                break;
            }
            // Undo dot-stuffing: a leading ".." was a literal "."
            let content = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line[..]
            };
            match content {
                [rest @ .., b'\r', b'\n'] | [rest @ .., b'\n'] => body.extend_from_slice(rest),
                _ => body.extend_from_slice(content),
            }
            body.push(b'\n');
        }

        Ok((body, read_bytes))
    }

    /// Anti-idle ping; any timely answer keeps the session alive
    pub async fn anti_idle(&mut self) -> Result<(), NntpError> {
        let response = self.exchange("DATE").await?;
        if response.code == 111 {
            Ok(())
        } else if response.code == 400 {
            Err(NntpError::SessionTimeout)
        } else {
            Err(NntpError::UnexpectedResponse {
                command: "DATE".to_string(),
                code: response.code,
                message: response.text,
            })
        }
    }

    /// Best-effort goodbye; errors are ignored, the socket closes on drop
    pub async fn quit(mut self) {
        let _ = self.send_command("QUIT").await;
        let _ = timeout(Duration::from_secs(2), self.read_response()).await;
    }

    async fn exchange(&mut self, command: &str) -> Result<Response, NntpError> {
        self.send_command(command).await?;
        let response = self.read_response().await?;
        // 400 means the server is closing the session (idle cutoff, overload)
        if response.code == 400 && !command.starts_with("DATE") {
            return Err(NntpError::SessionTimeout);
        }
        Ok(response)
    }

    async fn send_command(&mut self, command: &str) -> Result<(), NntpError> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Response, NntpError> {
        let mut line = Vec::new();
        let n = self.read_line_raw(&mut line).await?;
        if n == 0 {
            return Err(NntpError::Disconnected);
        }
        while matches!(line.last(), Some(b'\r' | b'\n')) {
            line.pop();
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        let code = text
            .get(..3)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| NntpError::UnexpectedResponse {
                command: "response".to_string(),
                code: 0,
                message: text.clone(),
            })?;
        let text = text.get(4..).unwrap_or("").to_string();
        Ok(Response { code, text })
    }

    async fn read_line_raw(&mut self, buf: &mut Vec<u8>) -> Result<usize, NntpError> {
        timeout(self.active_timeout, self.reader.read_until(b'\n', buf))
            .await
            .map_err(|_| NntpError::Timeout {
                seconds: self.active_timeout.as_secs(),
            })?
            .map_err(NntpError::Io)
    }
}
