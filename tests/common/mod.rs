//! In-process NNTP stub server for integration tests

#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// What the stub serves and how it behaves
#[derive(Default)]
pub struct StubBehavior {
    /// Article bodies by message-id (without angle brackets). Bodies are raw
    /// CRLF-separated lines; the stub applies dot-stuffing on the wire.
    pub articles: HashMap<String, Vec<u8>>,
    /// Groups the server carries; GROUP for anything else answers 411
    pub groups: Vec<String>,
    /// Require AUTHINFO USER/PASS before serving
    pub require_auth: bool,
    /// Added before every BODY payload, to let tests cancel mid-fetch
    pub body_delay: Duration,
}

/// A minimal NNTP server speaking just enough protocol for the client:
/// greeting, MODE READER, AUTHINFO, GROUP, BODY, DATE, QUIT.
pub struct StubServer {
    addr: SocketAddr,
}

impl StubServer {
    pub async fn start(behavior: StubBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let behavior = Arc::new(behavior);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let behavior = Arc::clone(&behavior);
                tokio::spawn(async move {
                    let _ = serve_session(stream, behavior).await;
                });
            }
        });

        Self { addr }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn serve_session(stream: TcpStream, behavior: Arc<StubBehavior>) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    writer.write_all(b"200 stub news server ready\r\n").await?;

    let mut authed = !behavior.require_auth;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end();
        let upper = command.to_ascii_uppercase();

        if upper == "QUIT" {
            writer.write_all(b"205 goodbye\r\n").await?;
            return Ok(());
        } else if upper == "MODE READER" {
            writer.write_all(b"200 reader mode\r\n").await?;
        } else if upper == "DATE" {
            writer.write_all(b"111 20260831120000\r\n").await?;
        } else if upper.starts_with("AUTHINFO USER") {
            writer.write_all(b"381 password required\r\n").await?;
        } else if upper.starts_with("AUTHINFO PASS") {
            authed = true;
            writer.write_all(b"281 authenticated\r\n").await?;
        } else if !authed {
            writer.write_all(b"480 authentication required\r\n").await?;
        } else if let Some(group) = command.strip_prefix("GROUP ") {
            if behavior.groups.iter().any(|g| g == group) {
                writer
                    .write_all(format!("211 10 1 10 {group}\r\n").as_bytes())
                    .await?;
            } else {
                writer.write_all(b"411 no such newsgroup\r\n").await?;
            }
        } else if let Some(id) = command.strip_prefix("BODY ") {
            let id = id.trim_start_matches('<').trim_end_matches('>');
            match behavior.articles.get(id) {
                Some(body) => {
                    if !behavior.body_delay.is_zero() {
                        tokio::time::sleep(behavior.body_delay).await;
                    }
                    writer
                        .write_all(format!("222 0 <{id}> body follows\r\n").as_bytes())
                        .await?;
                    writer.write_all(&dot_stuff(body)).await?;
                    writer.write_all(b".\r\n").await?;
                }
                None => {
                    writer.write_all(b"430 no such article\r\n").await?;
                }
            }
        } else {
            writer.write_all(b"500 command not recognized\r\n").await?;
        }
        writer.flush().await?;
    }
}

/// RFC 3977 dot-stuffing: a line starting with "." gets an extra "."
fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    for line in body.split_inclusive(|&b| b == b'\n') {
        if line.starts_with(b".") {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    // Make sure the block ends on a line boundary
    if !out.ends_with(b"\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Build an NZB manifest for one file spread over the given segments
pub fn manifest(filename: &str, group: &str, segments: &[(u32, u64, &str)]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">\n",
    );
    xml.push_str(&format!(
        "  <file poster=\"tester@example.com\" date=\"1\" \
         subject=\"demo &quot;{filename}&quot; (1/{})\">\n",
        segments.len()
    ));
    xml.push_str(&format!(
        "    <groups><group>{group}</group></groups>\n    <segments>\n"
    ));
    for (number, bytes, message_id) in segments {
        xml.push_str(&format!(
            "      <segment bytes=\"{bytes}\" number=\"{number}\">{message_id}</segment>\n"
        ));
    }
    xml.push_str("    </segments>\n  </file>\n</nzb>\n");
    xml
}
