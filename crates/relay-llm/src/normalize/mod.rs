//! Stream Event Normalizer.
//!
//! Turns provider text/reasoning deltas into the canonical [`StreamEvent`]
//! sequence for one provider attempt, separating `<think>`-style reasoning and
//! `<final>` answer spans from plain text. The tag state machine has three
//! states (no tag, reasoning open, final open) and is fed by [`TagScanner`].

pub mod scanner;

use relay_core::stream::{MessageOutcome, StreamEvent};
use tracing::debug;

pub use scanner::{TagKind, TagScanner, Token};

#[derive(Clone, Debug, PartialEq, Eq)]
enum TagState {
    None,
    Reasoning {
        open_literal: String,
        content: String,
    },
    Final,
}

/// What one attempt produced, for persistence and logging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NormalizedOutput {
    /// Equal to the concatenation of all emitted `text_delta` payloads.
    pub visible_text: String,
    pub reasoning: String,
    /// Text withheld from the visible stream (strict final mode).
    pub suppressed: String,
}

pub struct StreamNormalizer {
    provider: String,
    strict_final: bool,
    scanner: TagScanner,
    state: TagState,
    started: bool,
    ended: bool,
    text_open: bool,
    saw_final: bool,
    /// Plain text held back in strict mode until we know a final tag exists.
    deferred_plain: String,
    output: NormalizedOutput,
}

impl StreamNormalizer {
    pub fn new(provider: impl Into<String>, strict_final: bool) -> Self {
        Self {
            provider: provider.into(),
            strict_final,
            scanner: TagScanner::new(),
            state: TagState::None,
            started: false,
            ended: false,
            text_open: false,
            saw_final: false,
            deferred_plain: String::new(),
            output: NormalizedOutput::default(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn output(&self) -> &NormalizedOutput {
        &self.output
    }

    pub fn into_output(self) -> NormalizedOutput {
        self.output
    }

    /// `message_start`, emitted once.
    pub fn begin(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);
        events
    }

    pub fn push_text(&mut self, delta: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.ended {
            return events;
        }
        self.ensure_started(&mut events);
        for token in self.scanner.push(delta) {
            self.apply(token, &mut events);
        }
        events
    }

    /// Reasoning the provider reported on its own channel.
    pub fn push_reasoning(&mut self, delta: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.ended || delta.is_empty() {
            return events;
        }
        self.ensure_started(&mut events);
        self.emit_reasoning(delta, &mut events);
        events
    }

    /// Provider signalled completion: flush held text, resolve open spans and
    /// emit `message_end`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.ended {
            return events;
        }
        self.ensure_started(&mut events);
        for token in self.scanner.finish() {
            self.apply(token, &mut events);
        }

        match std::mem::replace(&mut self.state, TagState::None) {
            TagState::Reasoning {
                open_literal,
                content,
            } => {
                // Never closed: fail open and show it as ordinary text.
                let replay = format!("{open_literal}{content}");
                self.route_plain(&replay, &mut events);
            }
            TagState::Final | TagState::None => {}
        }

        if self.strict_final {
            let deferred = std::mem::take(&mut self.deferred_plain);
            if self.saw_final {
                if !deferred.is_empty() {
                    debug!(
                        provider = %self.provider,
                        chars = deferred.chars().count(),
                        "strict final mode suppressed text outside final span"
                    );
                }
            } else if !deferred.is_empty() {
                self.output.suppressed.clear();
                self.emit_visible(&deferred, &mut events);
            }
        }

        self.close_text(&mut events);
        self.end(MessageOutcome::Completed, &mut events);
        events
    }

    /// Provider failed mid-stream. Held-back text is dropped.
    pub fn fail(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.ended {
            return events;
        }
        self.ensure_started(&mut events);
        self.close_text(&mut events);
        self.end(MessageOutcome::Failed, &mut events);
        events
    }

    fn apply(&mut self, token: Token, events: &mut Vec<StreamEvent>) {
        match token {
            Token::Text(text) => {
                if let TagState::Reasoning { content, .. } = &mut self.state {
                    content.push_str(&text);
                }
                match self.state {
                    TagState::None => self.route_plain(&text, events),
                    TagState::Reasoning { .. } => self.emit_reasoning(&text, events),
                    TagState::Final => self.emit_visible(&text, events),
                }
            }
            Token::Tag {
                kind,
                closing: false,
                literal,
            } => match self.state {
                TagState::None => match kind {
                    TagKind::Reasoning => {
                        self.state = TagState::Reasoning {
                            open_literal: literal,
                            content: String::new(),
                        };
                    }
                    TagKind::Final => {
                        self.saw_final = true;
                        self.state = TagState::Final;
                    }
                },
                // Nested opens are literal text of the open span.
                _ => self.apply(Token::Text(literal), events),
            },
            Token::Tag {
                kind,
                closing: true,
                literal,
            } => match std::mem::replace(&mut self.state, TagState::None) {
                TagState::None => self.route_plain(&literal, events),
                TagState::Reasoning { content, .. } => {
                    if kind == TagKind::Final {
                        // It was a final span after all.
                        self.saw_final = true;
                        self.emit_visible(&content, events);
                    }
                }
                TagState::Final => {}
            },
        }
    }

    /// Text outside any tag.
    fn route_plain(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        if self.strict_final {
            self.deferred_plain.push_str(text);
            self.output.suppressed.push_str(text);
        } else {
            self.emit_visible(text, events);
        }
    }

    fn emit_visible(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        if !self.text_open {
            self.text_open = true;
            events.push(StreamEvent::TextStart {
                provider: self.provider.clone(),
            });
        }
        self.output.visible_text.push_str(text);
        events.push(StreamEvent::TextDelta {
            provider: self.provider.clone(),
            text: text.to_string(),
        });
    }

    fn emit_reasoning(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.close_text(events);
        self.output.reasoning.push_str(text);
        events.push(StreamEvent::ReasoningDelta {
            provider: self.provider.clone(),
            text: text.to_string(),
        });
    }

    fn close_text(&mut self, events: &mut Vec<StreamEvent>) {
        if self.text_open {
            self.text_open = false;
            events.push(StreamEvent::TextEnd {
                provider: self.provider.clone(),
            });
        }
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                provider: self.provider.clone(),
            });
        }
    }

    fn end(&mut self, outcome: MessageOutcome, events: &mut Vec<StreamEvent>) {
        self.ended = true;
        events.push(StreamEvent::MessageEnd {
            provider: self.provider.clone(),
            outcome,
        });
    }
}
