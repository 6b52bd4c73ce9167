use super::SseEvent;

/// Incremental `text/event-stream` decoder.
///
/// Bytes may arrive split at arbitrary points; complete frames are emitted as
/// soon as their terminating blank line is seen. The last event id persists
/// across frames, as the protocol requires.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    last_event_id: String,
    retry_hint: Option<u64>,
    pending_cr: bool,
    started: bool,
}

impl SseDecoder {
    /// Decoder for a resumed connection that starts from `last_event_id`.
    pub fn resuming(last_event_id: impl Into<String>) -> Self {
        Self {
            last_event_id: last_event_id.into(),
            ..Self::default()
        }
    }

    pub fn last_event_id(&self) -> &str {
        &self.last_event_id
    }

    /// Returns the most recent `retry` value seen since the last call.
    pub fn take_retry_hint(&mut self) -> Option<u64> {
        self.retry_hint.take()
    }

    /// Feeds a chunk and returns the events it completes.
    ///
    /// Fails when a completed frame is not valid UTF-8.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, String> {
        let mut chunk = chunk;
        if !self.started && !chunk.is_empty() {
            self.started = true;
            if let Some(rest) = chunk.strip_prefix(b"\xEF\xBB\xBF") {
                chunk = rest;
            }
        }
        self.append_normalized(chunk);

        let mut events = Vec::new();
        while let Some(idx) = find_frame_delimiter(&self.buf) {
            let frame_bytes: Vec<u8> = self.buf.drain(..idx + 2).take(idx).collect();
            if let Some(event) = self.parse_frame(&frame_bytes)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Rewrites CRLF and lone CR line endings to LF. A CR at the very end of
    /// a chunk is held back until the next byte shows whether an LF follows.
    fn append_normalized(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                self.buf.push(b'\n');
                if byte == b'\n' {
                    continue;
                }
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                self.buf.push(byte);
            }
        }
    }

    fn parse_frame(&mut self, bytes: &[u8]) -> Result<Option<SseEvent>, String> {
        if bytes.is_empty() {
            return Ok(None);
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|e| format!("event frame is not valid UTF-8: {e}"))?;
        let mut event_type: Option<String> = None;
        let mut data_lines: Vec<&str> = Vec::new();
        let mut retry: Option<u64> = None;
        for line in text.split('\n') {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event_type = Some(value.to_string()),
                "data" => data_lines.push(value),
                "id" => {
                    if !value.contains('\0') {
                        self.last_event_id = value.to_string();
                    }
                }
                "retry" => {
                    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                        if let Ok(ms) = value.parse::<u64>() {
                            retry = Some(ms);
                            self.retry_hint = Some(ms);
                        }
                    }
                }
                _ => {}
            }
        }
        if data_lines.is_empty() {
            return Ok(None);
        }
        Ok(Some(SseEvent {
            id: self.last_event_id.clone(),
            event: event_type
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data: data_lines.join("\n"),
            retry,
        }))
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\n\n")
}
