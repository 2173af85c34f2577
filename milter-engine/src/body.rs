use crate::message::MessageMutation;
use memchr::memchr2;
use miette::Result;

const COMMIT_CHUNK: usize = 65536;

/// Streaming line-ending normaliser for replacement bodies.
///
/// Bare `\n` becomes `\r\n`. A `\r` that ends a chunk is held back until
/// the next chunk shows whether it starts a `\r\n` pair.
#[derive(Debug, Default)]
pub struct BodyRewriter {
    pending_cr: bool,
    prev_cr: bool,
}

impl BodyRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rewrite(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        if self.pending_cr {
            out.push(b'\r');
            self.pending_cr = false;
            self.prev_cr = true;
        }

        let mut rest = chunk;
        while let Some(pos) = memchr2(b'\r', b'\n', rest) {
            if pos > 0 {
                out.extend_from_slice(&rest[..pos]);
                self.prev_cr = false;
            }
            let byte = rest[pos];
            rest = &rest[pos + 1..];

            if byte == b'\r' {
                if rest.is_empty() {
                    self.pending_cr = true;
                } else {
                    out.push(b'\r');
                    self.prev_cr = true;
                }
            } else {
                if !self.prev_cr {
                    out.push(b'\r');
                }
                out.push(b'\n');
                self.prev_cr = false;
            }
        }
        if !rest.is_empty() {
            out.extend_from_slice(rest);
            self.prev_cr = false;
        }
    }

    /// Flushes a held back `\r`.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if self.pending_cr {
            out.push(b'\r');
            self.pending_cr = false;
            self.prev_cr = true;
        }
    }
}

/// One filter's replacement body, held back until the filter's final
/// answer. A conversation that breaks off midway leaves the message as it
/// was.
#[derive(Debug, Default)]
pub struct BodyReplacement {
    rewriter: BodyRewriter,
    body: Vec<u8>,
}

impl BodyReplacement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalises and buffers one chunk.
    pub fn write(&mut self, chunk: &[u8]) {
        self.rewriter.rewrite(chunk, &mut self.body);
    }

    /// Swaps the buffered body into `message` and corrects its size.
    /// Returns the new body length.
    pub async fn commit(mut self, message: &mut dyn MessageMutation) -> Result<u64> {
        self.rewriter.finish(&mut self.body);

        let old_size = message.begin_body_replace().await?;
        message.adjust_size(-(old_size as i64));
        for chunk in self.body.chunks(COMMIT_CHUNK) {
            message.append_body_bytes(chunk).await?;
            message.adjust_size(chunk.len() as i64);
        }
        message.end_body_replace().await?;
        Ok(self.body.len() as u64)
    }
}
