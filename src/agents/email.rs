//! Email source agent (§4.12). IMAP (since `last_run`) or POP3.
//!
//! There's no IMAP/POP3 crate in the dependency stack, so this talks
//! both protocols directly over the TLS stack the platform already
//! depends on (`tokio-rustls` + `rustls-pki-types`). IMAP: connect,
//! `LOGIN`, `SELECT INBOX`, `SEARCH SINCE <last_run>`, then `FETCH` each
//! matching message's envelope and plain-text body. Only the subset of
//! the protocol a typical INBOX sync needs is implemented —
//! non-literal tagged responses with inline string literals, not
//! IMAP's full literal-continuation framing. POP3 has no server-side
//! date filter, so it lists every message in the maildrop and relies on
//! `max_items`/dedup downstream to bound the sync.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{rustls, TlsConnector};

use crate::error::{RagError, Result};
use crate::models::{AgentConfig, Document};

pub async fn run(config: &AgentConfig) -> Result<Vec<Document>> {
    let host = config.options.get("host").and_then(|v| v.as_str()).unwrap_or(&config.source_url);
    if host.is_empty() {
        return Err(RagError::ConfigInvalid("email agent requires options.host or source_url".to_string()));
    }

    let username = config
        .credentials
        .get("username")
        .ok_or_else(|| RagError::SourceAuth("email agent requires credentials.username".to_string()))?;
    let password = config
        .credentials
        .get("password")
        .ok_or_else(|| RagError::SourceAuth("email agent requires credentials.password".to_string()))?;

    let protocol = config.options.get("protocol").and_then(|v| v.as_str()).unwrap_or("imap");
    match protocol {
        "imap" => run_imap(config, host, username, password).await,
        "pop3" => run_pop3(config, host, username, password).await,
        other => Err(RagError::ConfigInvalid(format!(
            "email agent options.protocol must be \"imap\" or \"pop3\", got \"{other}\""
        ))),
    }
}

async fn run_imap(config: &AgentConfig, host: &str, username: &str, password: &str) -> Result<Vec<Document>> {
    let port = config.options.get("port").and_then(|v| v.as_u64()).unwrap_or(993) as u16;
    let mailbox = config.options.get("mailbox").and_then(|v| v.as_str()).unwrap_or("INBOX");

    let mut session = ImapSession::connect(host, port).await?;
    session.login(username, password).await?;
    session.select(mailbox).await?;

    let ids = session.search_since(config.last_run).await?;
    let mut ids = ids;
    if let Some(max) = config.max_items {
        ids.truncate(max);
    }

    let mut docs = Vec::with_capacity(ids.len());
    for id in ids {
        let message = session.fetch(id).await?;
        let mut doc = Document::new(format!("email:{host}:{id}"), message.body);
        doc.metadata.insert("subject".to_string(), serde_json::json!(message.subject));
        doc.metadata.insert("from".to_string(), serde_json::json!(message.from));
        docs.push(doc);
    }

    session.logout().await?;
    Ok(docs)
}

async fn run_pop3(config: &AgentConfig, host: &str, username: &str, password: &str) -> Result<Vec<Document>> {
    let port = config.options.get("port").and_then(|v| v.as_u64()).unwrap_or(995) as u16;

    let mut session = Pop3Session::connect(host, port).await?;
    session.login(username, password).await?;

    let mut ids = session.list().await?;
    if let Some(max) = config.max_items {
        ids.truncate(max);
    }

    let mut docs = Vec::with_capacity(ids.len());
    for id in ids {
        let message = session.retr(id).await?;
        let mut doc = Document::new(format!("email:{host}:{id}"), message.body);
        doc.metadata.insert("subject".to_string(), serde_json::json!(message.subject));
        doc.metadata.insert("from".to_string(), serde_json::json!(message.from));
        docs.push(doc);
    }

    session.quit().await?;
    Ok(docs)
}

struct FetchedMessage {
    subject: String,
    from: String,
    body: String,
}

struct ImapSession {
    reader: BufReader<tokio::io::ReadHalf<tokio_rustls::client::TlsStream<TcpStream>>>,
    writer: tokio::io::WriteHalf<tokio_rustls::client::TlsStream<TcpStream>>,
    tag: u32,
}

/// Connect and complete a TLS handshake against `host:port` using the
/// Mozilla trust anchors bundled by `webpki-roots`.
async fn connect_tls(host: &str, port: u16) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| RagError::RemoteUnavailable(format!("failed to connect to {host}:{port}: {e}")))?;
    let server_name = ServerName::try_from(host.to_string()).map_err(|e| RagError::ConfigInvalid(format!("invalid mail host: {e}")))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| RagError::RemoteUnavailable(format!("tls handshake with {host} failed: {e}")))
}

impl ImapSession {
    async fn connect(host: &str, port: u16) -> Result<Self> {
        let tls_stream = connect_tls(host, port).await?;
        let (read_half, write_half) = tokio::io::split(tls_stream);
        let mut session = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            tag: 0,
        };

        // Consume the untagged greeting line.
        let mut line = String::new();
        session
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| RagError::RemoteUnavailable(format!("failed to read imap greeting: {e}")))?;
        Ok(session)
    }

    fn next_tag(&mut self) -> String {
        self.tag += 1;
        format!("A{:04}", self.tag)
    }

    async fn command(&mut self, command: &str) -> Result<Vec<String>> {
        let tag = self.next_tag();
        let line = format!("{tag} {command}\r\n");
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RagError::Transport(format!("imap write failed: {e}")))?;

        let mut lines = Vec::new();
        loop {
            let mut raw = String::new();
            let n = self.reader.read_line(&mut raw).await.map_err(|e| RagError::Transport(format!("imap read failed: {e}")))?;
            if n == 0 {
                return Err(RagError::RemoteUnavailable("imap connection closed unexpectedly".to_string()));
            }
            let trimmed = raw.trim_end().to_string();
            let is_tagged_completion = trimmed.starts_with(&tag);
            lines.push(trimmed.clone());
            if is_tagged_completion {
                if trimmed.contains("OK") {
                    break;
                }
                return Err(RagError::SourceAuth(format!("imap command rejected: {trimmed}")));
            }
        }
        Ok(lines)
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.command(&format!("LOGIN {} {}", quote(username), quote(password))).await?;
        Ok(())
    }

    async fn select(&mut self, mailbox: &str) -> Result<()> {
        self.command(&format!("SELECT {}", quote(mailbox))).await?;
        Ok(())
    }

    async fn search_since(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<u32>> {
        let command = match since {
            Some(date) => format!("SEARCH SINCE {}", date.format("%d-%b-%Y")),
            None => "SEARCH ALL".to_string(),
        };
        let lines = self.command(&command).await?;
        let ids = lines
            .iter()
            .find(|l| l.starts_with("* SEARCH"))
            .map(|l| l.trim_start_matches("* SEARCH").split_whitespace().filter_map(|s| s.parse().ok()).collect())
            .unwrap_or_default();
        Ok(ids)
    }

    async fn fetch(&mut self, id: u32) -> Result<FetchedMessage> {
        let lines = self.command(&format!("FETCH {id} (BODY[])")).await?;
        let raw = lines.join("\r\n");
        Ok(parse_message(&raw))
    }

    async fn logout(&mut self) -> Result<()> {
        let _ = self.command("LOGOUT").await;
        Ok(())
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

struct Pop3Session {
    reader: BufReader<tokio::io::ReadHalf<tokio_rustls::client::TlsStream<TcpStream>>>,
    writer: tokio::io::WriteHalf<tokio_rustls::client::TlsStream<TcpStream>>,
}

impl Pop3Session {
    async fn connect(host: &str, port: u16) -> Result<Self> {
        let tls_stream = connect_tls(host, port).await?;
        let (read_half, write_half) = tokio::io::split(tls_stream);
        let mut session = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        // Consume the single-line greeting ("+OK ...").
        let greeting = session.read_line().await?;
        if !greeting.starts_with("+OK") {
            return Err(RagError::RemoteUnavailable(format!("unexpected pop3 greeting: {greeting}")));
        }
        Ok(session)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut raw = String::new();
        let n = self.reader.read_line(&mut raw).await.map_err(|e| RagError::Transport(format!("pop3 read failed: {e}")))?;
        if n == 0 {
            return Err(RagError::RemoteUnavailable("pop3 connection closed unexpectedly".to_string()));
        }
        Ok(raw.trim_end().to_string())
    }

    /// Send a single-line command and return its status line. Errs with
    /// `SourceAuth` on a `-ERR` response.
    async fn command(&mut self, command: &str) -> Result<String> {
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .await
            .map_err(|e| RagError::Transport(format!("pop3 write failed: {e}")))?;
        let line = self.read_line().await?;
        if line.starts_with("-ERR") {
            return Err(RagError::SourceAuth(format!("pop3 command rejected: {line}")));
        }
        Ok(line)
    }

    /// Read a multi-line response body terminated by a lone `.` line,
    /// undoing byte-stuffed leading dots per RFC 1939 §3.
    async fn read_multiline(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                break;
            }
            lines.push(line.strip_prefix("..").map(|rest| format!(".{rest}")).unwrap_or(line));
        }
        Ok(lines)
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.command(&format!("USER {username}")).await?;
        self.command(&format!("PASS {password}")).await?;
        Ok(())
    }

    /// List every message id currently in the maildrop (`LIST` with no
    /// argument), in ascending order.
    async fn list(&mut self) -> Result<Vec<u32>> {
        self.command("LIST").await?;
        let lines = self.read_multiline().await?;
        Ok(lines.iter().filter_map(|l| l.split_whitespace().next()?.parse().ok()).collect())
    }

    async fn retr(&mut self, id: u32) -> Result<FetchedMessage> {
        self.command(&format!("RETR {id}")).await?;
        let lines = self.read_multiline().await?;
        Ok(parse_message(&lines.join("\r\n")))
    }

    async fn quit(&mut self) -> Result<()> {
        let _ = self.command("QUIT").await;
        Ok(())
    }
}

/// Pull a plain-text subject/from/body out of a raw RFC 822 message
/// blob. Handles bare `text/plain` bodies; MIME multipart extraction
/// beyond the first text part is left to a dedicated parser.
fn parse_message(raw: &str) -> FetchedMessage {
    let mut subject = String::new();
    let mut from = String::new();
    let mut in_headers = true;
    let mut body_lines = Vec::new();

    for line in raw.lines() {
        if in_headers {
            if line.is_empty() {
                in_headers = false;
                continue;
            }
            if let Some(rest) = line.strip_prefix("Subject:") {
                subject = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("From:") {
                from = rest.trim().to_string();
            }
        } else {
            body_lines.push(line);
        }
    }

    FetchedMessage {
        subject,
        from,
        body: body_lines.join("\n").trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subject_from_and_body() {
        let raw = "Subject: Hello\r\nFrom: a@example.com\r\n\r\nBody text\r\nmore body";
        let message = parse_message(raw);
        assert_eq!(message.subject, "Hello");
        assert_eq!(message.from, "a@example.com");
        assert!(message.body.contains("Body text"));
    }

    #[test]
    fn quote_escapes_special_characters() {
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
    }

    #[tokio::test]
    async fn unknown_protocol_is_rejected() {
        let mut config = AgentConfig::new(crate::models::AgentType::Email, "mailbox", "interval:1h");
        config.options.insert("host".to_string(), serde_json::json!("mail.example.com"));
        config.options.insert("protocol".to_string(), serde_json::json!("smtp"));
        config.credentials.insert("username".to_string(), "u".to_string());
        config.credentials.insert("password".to_string(), "p".to_string());
        let err = run(&config).await.unwrap_err();
        assert_eq!(err.code(), "config_invalid");
    }
}
