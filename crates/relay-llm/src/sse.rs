//! Server-sent-events plumbing shared by the HTTP adapters.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;

use relay_core::errors::ProviderError;
use relay_core::stream::ProviderEvent;

pub const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// One dispatched SSE event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

/// Line-oriented SSE parser. Bytes are buffered until a full line arrives,
/// so multi-byte characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseEventParser {
    line_buffer: Vec<u8>,
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl SseEventParser {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                let line = std::mem::take(&mut self.line_buffer);
                self.process_line(&line, &mut events);
            } else {
                self.line_buffer.push(*byte);
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            self.process_line(&line, &mut events);
        }
        self.flush_event(&mut events);
        events
    }

    fn process_line(&mut self, line: &[u8], events: &mut Vec<SseEvent>) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            self.flush_event(events);
            return;
        }
        if line.starts_with(b":") {
            return;
        }
        if let Some(value) = line.strip_prefix(b"event:") {
            self.event_type = Some(field_value(value));
        } else if let Some(value) = line.strip_prefix(b"data:") {
            self.data_lines.push(field_value(value));
        }
    }

    fn flush_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.data_lines.is_empty() {
            self.event_type = None;
            return;
        }
        events.push(SseEvent {
            event_type: self.event_type.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

fn field_value(raw: &[u8]) -> String {
    let raw = raw.strip_prefix(b" ").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Parse a complete SSE text into events. Convenience for tests and
/// non-streaming fallbacks.
pub fn parse_sse_text(raw: &str) -> Vec<SseEvent> {
    let mut parser = SseEventParser::default();
    let mut events = parser.push_chunk(raw.as_bytes());
    events.extend(parser.finish());
    events
}

/// Provider-specific decoding of SSE events into [`ProviderEvent`]s.
pub trait SseDecoder: Send + Unpin + 'static {
    fn decode(&mut self, event: &SseEvent) -> Vec<ProviderEvent>;

    /// The byte stream ended. Return a terminal event if the decoder has not
    /// already produced one.
    fn finish(&mut self) -> Vec<ProviderEvent>;
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Wraps a response byte stream and yields decoded provider events.
/// If no bytes arrive within the idle window, yields a stream error.
/// Nothing is yielded after the first terminal event.
pub struct SseStream<D> {
    inner: ByteStream,
    parser: SseEventParser,
    decoder: D,
    pending: VecDeque<ProviderEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl<D: SseDecoder> SseStream<D> {
    pub fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        decoder: D,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, decoder, SSE_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        decoder: D,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: SseEventParser::default(),
            decoder,
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn next_pending(&mut self) -> Option<ProviderEvent> {
        let event = self.pending.pop_front()?;
        if matches!(event, ProviderEvent::Done { .. } | ProviderEvent::Error(_)) {
            self.finished = true;
            self.pending.clear();
        }
        Some(event)
    }
}

impl<D: SseDecoder> Stream for SseStream<D> {
    type Item = ProviderEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(event) = this.next_pending() {
            return Poll::Ready(Some(event));
        }
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + this.idle_duration;
                    this.idle_deadline.as_mut().reset(deadline);

                    for event in this.parser.push_chunk(&bytes) {
                        let decoded = this.decoder.decode(&event);
                        this.pending.extend(decoded);
                    }
                    if let Some(event) = this.next_pending() {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(ProviderEvent::Error(
                        ProviderError::StreamInterrupted(e.to_string()),
                    )));
                }
                Poll::Ready(None) => {
                    for event in this.parser.finish() {
                        let decoded = this.decoder.decode(&event);
                        this.pending.extend(decoded);
                    }
                    let tail = this.decoder.finish();
                    this.pending.extend(tail);
                    if let Some(event) = this.next_pending() {
                        return Poll::Ready(Some(event));
                    }
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    if this.idle_deadline.as_mut().poll(cx).is_ready() {
                        this.finished = true;
                        return Poll::Ready(Some(ProviderEvent::Error(
                            ProviderError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                this.idle_duration.as_secs()
                            )),
                        )));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use relay_core::messages::StopReason;

    use super::*;

    #[test]
    fn parses_event_and_data_lines() {
        let events = parse_sse_text(
            "event: message_start\ndata: {\"a\":1}\n\n: keep-alive\n\ndata: [DONE]\n\n",
        );
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event_type: Some("message_start".into()),
                    data: "{\"a\":1}".into()
                },
                SseEvent {
                    event_type: None,
                    data: "[DONE]".into()
                },
            ]
        );
    }

    #[test]
    fn handles_crlf_and_multiline_data() {
        let events = parse_sse_text("data: one\r\ndata: two\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn split_multibyte_across_chunks() {
        let mut parser = SseEventParser::default();
        let raw = "data: héllo\n\n".as_bytes();
        let (a, b) = raw.split_at(8); // splits inside 'é'
        assert!(parser.push_chunk(a).is_empty());
        let events = parser.push_chunk(b);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn trailing_event_without_blank_line() {
        let events = parse_sse_text("data: last");
        assert_eq!(events[0].data, "last");
    }

    /// Echoes each data payload as a text delta; `end` terminates.
    struct EchoDecoder {
        done: bool,
    }

    impl SseDecoder for EchoDecoder {
        fn decode(&mut self, event: &SseEvent) -> Vec<ProviderEvent> {
            if event.data == "end" {
                self.done = true;
                return vec![ProviderEvent::Done {
                    stop_reason: StopReason::EndTurn,
                }];
            }
            vec![ProviderEvent::TextDelta(event.data.clone())]
        }

        fn finish(&mut self) -> Vec<ProviderEvent> {
            if self.done {
                Vec::new()
            } else {
                vec![ProviderEvent::Error(ProviderError::StreamInterrupted(
                    "eof".into(),
                ))]
            }
        }
    }

    fn bytes_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(bytes::Bytes::from_static(c.as_bytes()))),
        )
    }

    #[tokio::test]
    async fn stream_stops_after_done() {
        let stream = SseStream::new(
            bytes_stream(vec!["data: a\n\ndata: b\n\n", "data: end\n\ndata: ignored\n\n"]),
            EchoDecoder { done: false },
        );
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t == "a"));
        assert!(matches!(&events[2], ProviderEvent::Done { .. }));
    }

    #[tokio::test]
    async fn premature_eof_reports_error() {
        let stream = SseStream::new(bytes_stream(vec!["data: a\n\n"]), EchoDecoder { done: false });
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ProviderEvent::Error(ProviderError::StreamInterrupted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fires() {
        let stalled = futures::stream::pending::<Result<bytes::Bytes, reqwest::Error>>();
        let mut stream = SseStream::with_idle_timeout(
            stalled,
            EchoDecoder { done: false },
            Duration::from_secs(5),
        );
        let event = stream.next().await;
        assert!(matches!(
            event,
            Some(ProviderEvent::Error(ProviderError::StreamInterrupted(msg))) if msg.contains("idle")
        ));
        assert!(stream.next().await.is_none());
    }
}
