//! Synthesis of the `Received:` trace header.
//!
//! Every SMTP hop records itself by prepending a `Received:` header to
//! the message ([RFC 5321, section 4.4](https://www.rfc-editor.org/rfc/rfc5321#section-4.4)).
//! [`ReceivedHeader`] captures the information of one hop and renders the
//! exact byte layout expected by mail-log parsers.

use std::{
    fmt::Display,
    net::{IpAddr, SocketAddr},
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::SmtpConfig;

/// Marker rendered in the `from` clause when the client never sent HELO/EHLO,
/// log parsers expect the literal `null` there.
pub const ABSENT_HELO: &str = "null";

/// Indentation used for the folded header lines.
const FOLD: &str = "        ";

/// Timestamp layout, RFC 2822 date followed by the zone name.
const TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z (%Z)";

/// Address of the remote SMTP client with its (optional) resolved name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub address: IpAddr,
    pub hostname: Option<String>,
}

impl RemoteHost {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            hostname: None,
        }
    }

    /// Attaches the name obtained by reverse resolution of the address.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Formats the TCP-info element of the `from` clause.
    ///
    /// A failed reverse lookup usually yields the address literal itself,
    /// in which case only the bracketed literal is rendered.
    ///
    /// ```rust
    /// use mailsis_session::RemoteHost;
    ///
    /// let host = RemoteHost::new("209.237.247.14".parse().unwrap());
    /// assert_eq!(host.tcp_info(), "[209.237.247.14]");
    ///
    /// let host = host.with_hostname("wasabi.infohazard.org");
    /// assert_eq!(host.tcp_info(), "wasabi.infohazard.org [209.237.247.14]");
    /// ```
    pub fn tcp_info(&self) -> String {
        let literal = self.address.to_string();
        match &self.hostname {
            Some(hostname) if *hostname != literal => format!("{hostname} [{literal}]"),
            _ => format!("[{literal}]"),
        }
    }
}

impl From<IpAddr> for RemoteHost {
    fn from(address: IpAddr) -> Self {
        Self::new(address)
    }
}

impl From<SocketAddr> for RemoteHost {
    fn from(address: SocketAddr) -> Self {
        Self::new(address.ip())
    }
}

/// Generates a fresh transaction id for the `id` clause.
pub fn new_transaction_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Description of one transit hop, rendered as a `Received:` header.
///
/// The timestamp is captured when the value is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedHeader {
    helo: Option<String>,
    remote: RemoteHost,
    server: String,
    software: Option<String>,
    transaction_id: String,
    recipient: Option<String>,
    timestamp: DateTime<Utc>,
}

impl ReceivedHeader {
    pub fn new(
        remote: impl Into<RemoteHost>,
        server: impl Into<String>,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self {
            helo: None,
            remote: remote.into(),
            server: server.into(),
            software: None,
            transaction_id: transaction_id.into(),
            recipient: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates a header using the server identity and software tag from
    /// the `[smtp]` configuration section.
    pub fn from_config(
        config: &SmtpConfig,
        remote: impl Into<RemoteHost>,
        transaction_id: impl Into<String>,
    ) -> Self {
        let header = Self::new(remote, config.hostname.clone(), transaction_id);
        match &config.software {
            Some(software) => header.software(software.clone()),
            None => header,
        }
    }

    /// Name the client announced with HELO/EHLO.
    pub fn helo(mut self, helo: impl Into<String>) -> Self {
        self.helo = Some(helo.into());
        self
    }

    /// Software name and version printed in the `with` clause.
    pub fn software(mut self, software: impl Into<String>) -> Self {
        self.software = Some(software.into());
        self
    }

    /// Sole recipient of the transaction, leave unset with several recipients.
    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Sets the `for` clause only when exactly one recipient is given.
    pub fn recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut recipients = recipients.into_iter();
        self.recipient = match (recipients.next(), recipients.next()) {
            (Some(single), None) => Some(single.into()),
            _ => None,
        };
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Renders the header with CRLF line endings, including the final one.
    pub fn render(&self) -> String {
        let helo = self.helo.as_deref().unwrap_or(ABSENT_HELO);
        let mut header = format!(
            "Received: from {helo} ({})\r\n{FOLD}by {}\r\n{FOLD}with SMTP",
            self.remote.tcp_info(),
            self.server
        );
        if let Some(software) = &self.software {
            header.push_str(&format!(" ({software})"));
        }
        header.push_str(&format!(" id {}", self.transaction_id));
        if let Some(recipient) = &self.recipient {
            header.push_str(&format!("\r\n{FOLD}for {recipient}"));
        }
        header.push_str(&format!(
            ";\r\n{FOLD}{}\r\n",
            self.timestamp.format(TIMESTAMP_FORMAT)
        ));
        header
    }

    /// Rendered header as ASCII bytes, non ASCII characters become `?`.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.render()
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect()
    }
}

impl Display for ReceivedHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}
