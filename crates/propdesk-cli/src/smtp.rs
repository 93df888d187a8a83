//! Minimal SMTP dialogue used to check the configured mail relay.
//!
//! Connects, greets, and asks the relay whether it would accept mail for the
//! test recipient (`RCPT TO`). No message body is ever sent.

use std::time::Duration;

use async_trait::async_trait;
use propdesk_core::config::MailConfig;
use propdesk_scheduler::handlers::{HandlerError, MailProbe};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

pub struct SmtpProbe {
    host: String,
    port: u16,
    helo: String,
    timeout: Duration,
}

impl SmtpProbe {
    pub fn from_config(cfg: &MailConfig) -> Self {
        Self {
            host: cfg.smtp_host.clone(),
            port: cfg.smtp_port,
            helo: cfg.helo_name.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
        }
    }

    async fn converse(&self, recipient: &str) -> Result<String, HandlerError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| HandlerError::failed(format!("connect {}:{}: {e}", self.host, self.port)))?;
        let (read, mut write) = stream.into_split();
        let mut read = BufReader::new(read);

        expect(&mut read, &[220], "greeting").await?;
        command(&mut write, &format!("EHLO {}", self.helo)).await?;
        expect(&mut read, &[250], "EHLO").await?;
        command(&mut write, &format!("MAIL FROM:<postmaster@{}>", self.helo)).await?;
        expect(&mut read, &[250], "MAIL FROM").await?;
        command(&mut write, &format!("RCPT TO:<{recipient}>")).await?;
        let (code, text) = expect(&mut read, &[250, 251], "RCPT TO").await?;

        // Best effort; the answer we needed is already in.
        let _ = command(&mut write, "QUIT").await;
        Ok(format!("{code} {text}"))
    }
}

#[async_trait]
impl MailProbe for SmtpProbe {
    async fn probe(&self, recipient: &str) -> Result<String, HandlerError> {
        debug!(host = %self.host, port = self.port, %recipient, "probing mail relay");
        tokio::time::timeout(self.timeout, self.converse(recipient))
            .await
            .map_err(|_| {
                HandlerError::failed(format!(
                    "mail relay {}:{} did not answer within {}s",
                    self.host,
                    self.port,
                    self.timeout.as_secs()
                ))
            })?
    }
}

async fn command(write: &mut OwnedWriteHalf, line: &str) -> Result<(), HandlerError> {
    write
        .write_all(format!("{line}\r\n").as_bytes())
        .await
        .map_err(|e| HandlerError::failed(format!("write to mail relay: {e}")))
}

/// Read one (possibly multi-line) reply and check its code.
async fn expect(
    read: &mut BufReader<OwnedReadHalf>,
    accepted: &[u16],
    step: &str,
) -> Result<(u16, String), HandlerError> {
    let (code, text) = read_reply(read).await?;
    if accepted.contains(&code) {
        Ok((code, text))
    } else {
        Err(HandlerError::failed(format!(
            "mail relay rejected {step}: {code} {text}"
        )))
    }
}

async fn read_reply(read: &mut BufReader<OwnedReadHalf>) -> Result<(u16, String), HandlerError> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = read
            .read_line(&mut line)
            .await
            .map_err(|e| HandlerError::failed(format!("read from mail relay: {e}")))?;
        if n == 0 {
            return Err(HandlerError::failed("mail relay closed the connection"));
        }
        let (code, more, text) = parse_reply_line(line.trim_end())
            .ok_or_else(|| HandlerError::failed(format!("malformed SMTP reply: {:?}", line.trim_end())))?;
        if !more {
            return Ok((code, text.to_string()));
        }
    }
}

/// `250-PIPELINING` → (250, true, "PIPELINING"); `250 OK` → (250, false, "OK").
fn parse_reply_line(line: &str) -> Option<(u16, bool, &str)> {
    let code = line.get(..3)?.parse().ok()?;
    match line.as_bytes().get(3) {
        None => Some((code, false, "")),
        Some(b'-') => Some((code, true, &line[4..])),
        Some(b' ') => Some((code, false, &line[4..])),
        Some(_) => None,
    }
}
