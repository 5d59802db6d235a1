//! Server-Sent Events (text/event-stream) parsing.
//!
//! The parser works on raw bytes and only decodes complete lines, so a
//! multi-byte character split across network chunks is never mangled.

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, `"message"` when absent.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
    /// `retry:` hint in milliseconds.
    pub retry: Option<u64>,
}

impl Default for SseEvent {
    fn default() -> Self {
        Self {
            event: "message".to_string(),
            data: String::new(),
            id: None,
            retry: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseEvent,
    has_data: bool,
    started: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        if !self.started && self.buffer.len() >= 3 {
            self.started = true;
            if self.buffer.starts_with(b"\xEF\xBB\xBF") {
                self.buffer.drain(..3);
            }
        }

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(rel) = self.buffer[start..]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')
        {
            let pos = start + rel;
            let next = if self.buffer[pos] == b'\r' {
                match self.buffer.get(pos + 1) {
                    Some(b'\n') => pos + 2,
                    Some(_) => pos + 1,
                    // CR at the end of the chunk; wait to see if LF follows.
                    None => break,
                }
            } else {
                pos + 1
            };
            let line = String::from_utf8_lossy(&self.buffer[start..pos]).into_owned();
            start = next;

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else {
                self.process_line(&line);
            }
        }
        self.buffer.drain(..start);
        events
    }

    /// Drop a partially received event at end of stream.
    ///
    /// An event is only complete once its blank line arrives. Returns whether
    /// anything was pending.
    pub fn discard_pending(&mut self) -> bool {
        let pending = !self.buffer.is_empty() || self.has_data;
        self.buffer.clear();
        self.current = SseEvent::default();
        self.has_data = false;
        pending
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.current.event = value.to_string(),
            "data" => {
                self.current.data.push_str(value);
                self.current.data.push('\n');
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.current.id = Some(value.to_string()),
            "retry" => self.current.retry = value.parse().ok(),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !self.has_data {
            // The id still applies to later events.
            self.current = SseEvent {
                id: self.current.id.take(),
                ..SseEvent::default()
            };
            return None;
        }
        let mut event = std::mem::take(&mut self.current);
        self.has_data = false;
        if event.data.ends_with('\n') {
            event.data.pop();
        }
        if event.event.is_empty() {
            event.event = "message".to_string();
        }
        Some(event)
    }
}
