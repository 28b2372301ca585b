//! SSE decoding shared by the streaming backends.
//!
//! Backends deliver response bodies as arbitrary byte chunks, so frame
//! boundaries fall anywhere. The decoder buffers the tail of an incomplete
//! line between chunks and yields only `data:` payloads; comment lines,
//! other field names, and blank keep-alive lines never reach the adapters.
#[derive(Default)]
pub struct SseDecoder {
    tail: Vec<u8>,
}

impl SseDecoder {
    /// Absorbs one body chunk and returns the payloads it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.tail.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = memchr::memchr(b'\n', &self.tail[consumed..]) {
            let line_end = consumed + offset;
            payloads.extend(data_payload(&self.tail[consumed..line_end]));
            consumed = line_end + 1;
        }
        self.tail.drain(..consumed);
        payloads
    }

    /// Drains an unterminated trailing line once the body ends.
    pub fn finish(&mut self) -> Option<String> {
        let payload = data_payload(&self.tail);
        self.tail.clear();
        payload
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(line).ok()?.trim();
    let payload = text.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        None
    } else {
        Some(payload.to_string())
    }
}
