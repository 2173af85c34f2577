use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use miette::{bail, IntoDiagnostic, Result};
use std::pin::Pin;

const BODY_CHUNK: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
    /// Added by the MTA itself rather than by the sender. Such headers are
    /// never shown to filters and never changed by them.
    pub generated: bool,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Header {
            name: name.into(),
            value: value.into(),
            generated: false,
        }
    }

    /// Size of the header as written out, `name: value\r\n`.
    fn wire_len(&self) -> i64 {
        (self.name.len() + self.value.len() + 4) as i64
    }
}

/// Access to the message of the current transaction.
///
/// The engine calls these one at a time and waits for each to finish
/// before issuing the next.
#[async_trait]
pub trait MessageMutation: Send + Sync {
    fn headers(&self) -> Vec<Header>;
    fn body_stream(&self) -> Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + '_>>;

    async fn add_header(&mut self, name: &str, value: &str) -> Result<()>;
    /// Changes the `index`th (1-based) user header called `name`. An empty
    /// value deletes it.
    async fn change_header(&mut self, name: &str, index: u32, value: &str) -> Result<()>;
    async fn add_recipient(&mut self, address: &str) -> Result<()>;
    async fn delete_recipient(&mut self, address: &str) -> Result<()>;
    async fn quarantine(&mut self, reason: &str) -> Result<()>;

    /// Truncates the body and returns its previous size.
    async fn begin_body_replace(&mut self) -> Result<u64>;
    async fn append_body_bytes(&mut self, bytes: &[u8]) -> Result<()>;
    async fn end_body_replace(&mut self) -> Result<()>;

    fn adjust_size(&mut self, delta: i64);
}

/// A message held entirely in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryMessage {
    pub sender: String,
    pub recipients: Vec<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
    size: i64,
    quarantine: Option<String>,
    replacing: bool,
}

impl InMemoryMessage {
    pub fn new(sender: impl Into<String>, recipients: Vec<String>) -> Self {
        InMemoryMessage {
            sender: sender.into(),
            recipients,
            ..Default::default()
        }
    }

    /// Splits a raw RFC 5322 message into headers and body.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (parsed, body_start) = mailparse::parse_headers(raw).into_diagnostic()?;
        let headers = parsed
            .iter()
            .map(|h| {
                let value = String::from_utf8_lossy(h.get_value_raw());
                Header::new(h.get_key(), unfold(&value))
            })
            .collect();

        Ok(InMemoryMessage {
            headers,
            body: raw[body_start..].to_vec(),
            size: raw.len() as i64,
            ..Default::default()
        })
    }

    pub fn push_header(&mut self, header: Header) {
        self.size += header.wire_len();
        self.headers.push(header);
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        let body = body.into();
        self.size += body.len() as i64 - self.body.len() as i64;
        self.body = body;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn quarantine_reason(&self) -> Option<&str> {
        self.quarantine.as_deref()
    }

    /// Headers followed by the body, as it would be queued.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 1024);
        for header in &self.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn unfold(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn same_address(a: &str, b: &str) -> bool {
    let strip = |s: &str| s.trim().trim_start_matches('<').trim_end_matches('>').to_string();
    strip(a).eq_ignore_ascii_case(&strip(b))
}

#[async_trait]
impl MessageMutation for InMemoryMessage {
    fn headers(&self) -> Vec<Header> {
        self.headers.clone()
    }

    fn body_stream(&self) -> Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + '_>> {
        Box::pin(async_stream::stream! {
            for chunk in self.body.chunks(BODY_CHUNK) {
                yield Ok::<_, miette::Report>(Bytes::copy_from_slice(chunk));
            }
        })
    }

    async fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.push_header(Header::new(name, value));
        Ok(())
    }

    async fn change_header(&mut self, name: &str, index: u32, value: &str) -> Result<()> {
        let nth = index.max(1) as usize - 1;
        let position = self
            .headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.generated && h.name.eq_ignore_ascii_case(name))
            .nth(nth)
            .map(|(i, _)| i);

        match position {
            Some(i) if value.is_empty() => {
                let removed = self.headers.remove(i);
                self.size -= removed.wire_len();
            }
            Some(i) => {
                let header = &mut self.headers[i];
                self.size += value.len() as i64 - header.value.len() as i64;
                header.value = value.to_string();
            }
            None if value.is_empty() => {}
            None => self.push_header(Header::new(name, value)),
        }
        Ok(())
    }

    async fn add_recipient(&mut self, address: &str) -> Result<()> {
        self.recipients.push(address.to_string());
        Ok(())
    }

    async fn delete_recipient(&mut self, address: &str) -> Result<()> {
        if let Some(i) = self
            .recipients
            .iter()
            .position(|r| same_address(r, address))
        {
            self.recipients.remove(i);
        }
        Ok(())
    }

    async fn quarantine(&mut self, reason: &str) -> Result<()> {
        self.quarantine = Some(reason.to_string());
        Ok(())
    }

    async fn begin_body_replace(&mut self) -> Result<u64> {
        if self.replacing {
            bail!("body replacement already in progress");
        }
        self.replacing = true;
        let old = self.body.len() as u64;
        self.body.clear();
        Ok(old)
    }

    async fn append_body_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.replacing {
            bail!("body replacement was not started");
        }
        self.body.extend_from_slice(bytes);
        Ok(())
    }

    async fn end_body_replace(&mut self) -> Result<()> {
        self.replacing = false;
        Ok(())
    }

    fn adjust_size(&mut self, delta: i64) {
        self.size += delta;
    }
}
