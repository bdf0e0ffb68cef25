//! Output decoding and scrollback.

/// Incremental UTF-8 decoder for PTY reads.
///
/// A read can end in the middle of a multi-byte character; the incomplete
/// tail is carried into the next call. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `chunk`, returning every complete character seen so far.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end of the chunk.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flushes any carried bytes as replacement characters.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Bounded tail of a session's output, used as its screen-state snapshot.
#[derive(Debug)]
pub struct Scrollback {
    data: String,
    limit: usize,
}

impl Scrollback {
    /// Creates a scrollback holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            data: String::new(),
            limit,
        }
    }

    /// Appends output, dropping the oldest characters past the limit.
    pub fn push(&mut self, output: &str) {
        self.data.push_str(output);
        if self.data.len() <= self.limit {
            return;
        }
        let mut cut = self.data.len() - self.limit;
        while !self.data.is_char_boundary(cut) {
            cut += 1;
        }
        self.data.drain(..cut);
    }

    pub fn snapshot(&self) -> String {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
