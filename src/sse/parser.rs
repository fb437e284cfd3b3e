use futures::{Stream, StreamExt};

/// A dispatched server-sent event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl Event {
    /// Keepalive records the platform interleaves with real events
    pub fn is_ping(&self) -> bool {
        self.event.as_deref() == Some("ping") || self.data == "1"
    }
}

/// Incremental `text/event-stream` parser.
///
/// Bytes may be split anywhere, including inside a line; partial lines are kept until the
/// terminator arrives.
#[derive(Debug, Default)]
pub struct EventParser {
    buffer: Vec<u8>,
    pending: Event,
    data: Vec<String>,
    dirty: bool,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn line(&mut self, line: &str) -> Option<Event> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.pending.event = Some(value.to_string()),
            "id" => self.pending.id = Some(value.to_string()),
            "retry" => match value.parse() {
                Ok(retry) => self.pending.retry = Some(retry),
                Err(_) => return None,
            },
            _ => return None,
        }
        self.dirty = true;
        None
    }

    fn dispatch(&mut self) -> Option<Event> {
        if !std::mem::take(&mut self.dirty) {
            return None;
        }

        let mut event = std::mem::take(&mut self.pending);
        event.data = std::mem::take(&mut self.data).join("\n");
        Some(event)
    }
}

/// Turn a byte stream into a stream of events, passing transport errors through
pub fn events<S, B, E>(stream: S) -> impl Stream<Item = Result<Event, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    stream
        .scan(EventParser::new(), |parser, chunk| {
            let out: Vec<Result<Event, E>> = match chunk {
                Ok(bytes) => parser.feed(bytes.as_ref()).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            futures::future::ready(Some(futures::stream::iter(out)))
        })
        .flatten()
}
