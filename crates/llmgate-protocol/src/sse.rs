use bytes::Bytes;

/// Terminal frame payload used by OpenAI-style streams.
pub const DONE_PAYLOAD: &str = "[DONE]";

/// Incremental decoder for `data:`-framed SSE bodies.
///
/// Upstream chunks split lines at arbitrary byte boundaries; the decoder
/// buffers across pushes and only yields complete `data:` payloads.
/// Non-data lines (event names, comments, blanks) are dropped.
#[derive(Debug, Default)]
pub struct DataFrameDecoder {
    buffer: String,
}

impl DataFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }

        payloads
    }

    /// Flush a trailing line that never received its newline.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        let line = line.strip_suffix('\r').unwrap_or(&line);
        data_payload(line)
    }
}

fn data_payload(line: &str) -> Option<String> {
    let value = line.strip_prefix("data:")?;
    let value = value.strip_prefix(' ').unwrap_or(value);
    if value.is_empty() {
        return None;
    }
    Some(value.to_string())
}
