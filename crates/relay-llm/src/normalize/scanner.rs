//! Incremental lexer for model text.
//!
//! Splits streamed text into plain text and reasoning/final tag tokens in a
//! single pass. Code regions (fenced blocks and inline code spans) are passed
//! through as text and never scanned for tags. Input that could still turn
//! into a tag, a fence, or an inline code span is held back until more text
//! arrives or [`TagScanner::finish`] is called.

/// Which span a tag opens or closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagKind {
    Reasoning,
    Final,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Text(String),
    Tag {
        kind: TagKind,
        closing: bool,
        /// Exact source text of the tag, for fail-open replay.
        literal: String,
    },
}

const REASONING_TAGS: &[&str] = &["think", "thinking", "thought", "antthinking"];
const FINAL_TAG: &str = "final";
const MAX_TAG_LEN: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Region {
    Prose,
    Fenced { ch: char, len: usize },
}

enum Probe<T> {
    Match(T),
    NoMatch,
    NeedMore,
}

pub struct TagScanner {
    buf: String,
    region: Region,
    at_line_start: bool,
}

impl Default for TagScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl TagScanner {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            region: Region::Prose,
            at_line_start: true,
        }
    }

    /// True while inside a fenced code block.
    pub fn in_code_block(&self) -> bool {
        matches!(self.region, Region::Fenced { .. })
    }

    pub fn push(&mut self, text: &str) -> Vec<Token> {
        self.buf.push_str(text);
        self.scan(false)
    }

    /// Resolve everything still held back. Ambiguous text becomes plain text.
    pub fn finish(&mut self) -> Vec<Token> {
        self.scan(true)
    }

    fn scan(&mut self, eof: bool) -> Vec<Token> {
        let buf = std::mem::take(&mut self.buf);
        let mut tokens = Vec::new();
        let mut text = String::new();
        let mut i = 0;

        while i < buf.len() {
            let rest = &buf[i..];

            if self.at_line_start {
                match probe_fence(rest, self.region, eof) {
                    Probe::NeedMore => break,
                    Probe::Match((consumed, ch, len)) => {
                        text.push_str(&rest[..consumed]);
                        i += consumed;
                        self.at_line_start = false;
                        self.region = match self.region {
                            Region::Prose => Region::Fenced { ch, len },
                            Region::Fenced { .. } => Region::Prose,
                        };
                        continue;
                    }
                    Probe::NoMatch => self.at_line_start = false,
                }
            }

            let Some(c) = rest.chars().next() else { break };

            if c == '\n' {
                text.push(c);
                i += 1;
                self.at_line_start = true;
                continue;
            }

            if self.region == Region::Prose {
                if c == '`' {
                    match probe_inline_code(rest, eof) {
                        Probe::NeedMore => break,
                        Probe::Match(len) => {
                            text.push_str(&rest[..len]);
                            i += len;
                        }
                        Probe::NoMatch => {
                            // Literal backtick run.
                            let run = run_length(rest, '`');
                            text.push_str(&rest[..run]);
                            i += run;
                        }
                    }
                    continue;
                }

                if c == '<' {
                    match probe_tag(rest, eof) {
                        Probe::NeedMore => break,
                        Probe::Match((len, kind, closing)) => {
                            if !text.is_empty() {
                                tokens.push(Token::Text(std::mem::take(&mut text)));
                            }
                            tokens.push(Token::Tag {
                                kind,
                                closing,
                                literal: rest[..len].to_string(),
                            });
                            i += len;
                            continue;
                        }
                        Probe::NoMatch => {}
                    }
                }
            }

            text.push(c);
            i += c.len_utf8();
        }

        if !text.is_empty() {
            tokens.push(Token::Text(text));
        }
        self.buf = buf[i..].to_string();
        tokens
    }
}

fn run_length(s: &str, ch: char) -> usize {
    s.chars().take_while(|&c| c == ch).count() * ch.len_utf8()
}

/// Fence open (in prose) or close (in a fenced block) at the start of a line:
/// up to three spaces, then a run of backticks/tildes. Returns the consumed
/// byte length, fence char and run length.
fn probe_fence(s: &str, region: Region, eof: bool) -> Probe<(usize, char, usize)> {
    let indent = s.chars().take_while(|&c| c == ' ').count();
    if indent == s.len() {
        return if eof { Probe::NoMatch } else { Probe::NeedMore };
    }
    if indent > 3 {
        return Probe::NoMatch;
    }
    let after = &s[indent..];
    let Some(first) = after.chars().next() else {
        return Probe::NoMatch;
    };
    if first != '`' && first != '~' {
        return Probe::NoMatch;
    }
    let run = run_length(after, first);
    if run == after.len() && !eof {
        // The run might continue in the next chunk.
        return Probe::NeedMore;
    }
    match region {
        Region::Prose if run >= 3 => Probe::Match((indent + run, first, run)),
        Region::Fenced { ch, len } if ch == first && run >= len => {
            Probe::Match((indent + run, first, run))
        }
        _ => Probe::NoMatch,
    }
}

/// Inline code starting at a backtick run of length n: matches through the
/// next run of exactly n backticks on the same line.
fn probe_inline_code(s: &str, eof: bool) -> Probe<usize> {
    let open = run_length(s, '`');
    if open == s.len() && !eof {
        return Probe::NeedMore;
    }
    let mut i = open;
    while i < s.len() {
        let rest = &s[i..];
        let Some(c) = rest.chars().next() else { break };
        match c {
            '\n' => return Probe::NoMatch,
            '`' => {
                let run = run_length(rest, '`');
                if i + run == s.len() && !eof {
                    return Probe::NeedMore;
                }
                if run == open {
                    return Probe::Match(i + run);
                }
                i += run;
            }
            _ => i += c.len_utf8(),
        }
    }
    if eof {
        Probe::NoMatch
    } else {
        Probe::NeedMore
    }
}

/// `<` ws* `/`? ws* name ws* `>`, name matched ASCII case-insensitively.
fn probe_tag(s: &str, eof: bool) -> Probe<(usize, TagKind, bool)> {
    let bytes = s.as_bytes();
    let mut i = 1;
    let mut closing = false;
    let mut name = String::new();
    let mut name_done = false;

    while i < bytes.len() {
        if i >= MAX_TAG_LEN {
            return Probe::NoMatch;
        }
        let b = bytes[i];
        match b {
            b'>' => {
                return match classify_name(&name) {
                    Some(kind) => Probe::Match((i + 1, kind, closing)),
                    None => Probe::NoMatch,
                };
            }
            b' ' | b'\t' => {
                if !name.is_empty() {
                    name_done = true;
                }
            }
            b'/' if name.is_empty() && !closing => closing = true,
            b if b.is_ascii_alphabetic() && !name_done => {
                name.push(b.to_ascii_lowercase() as char);
                if !is_name_prefix(&name) {
                    return Probe::NoMatch;
                }
            }
            _ => return Probe::NoMatch,
        }
        i += 1;
    }

    if eof {
        Probe::NoMatch
    } else {
        Probe::NeedMore
    }
}

fn classify_name(name: &str) -> Option<TagKind> {
    if name == FINAL_TAG {
        Some(TagKind::Final)
    } else if REASONING_TAGS.contains(&name) {
        Some(TagKind::Reasoning)
    } else {
        None
    }
}

fn is_name_prefix(prefix: &str) -> bool {
    FINAL_TAG.starts_with(prefix) || REASONING_TAGS.iter().any(|t| t.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(chunks: &[&str]) -> Vec<Token> {
        let mut s = TagScanner::new();
        let mut out = Vec::new();
        for c in chunks {
            out.extend(s.push(c));
        }
        out.extend(s.finish());
        merge_text(out)
    }

    fn merge_text(tokens: Vec<Token>) -> Vec<Token> {
        let mut out: Vec<Token> = Vec::new();
        for t in tokens {
            if let (Some(Token::Text(prev)), Token::Text(next)) = (out.last_mut(), &t) {
                prev.push_str(next);
                continue;
            }
            out.push(t);
        }
        out
    }

    fn tag(kind: TagKind, closing: bool, literal: &str) -> Token {
        Token::Tag {
            kind,
            closing,
            literal: literal.into(),
        }
    }

    fn text(s: &str) -> Token {
        Token::Text(s.into())
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(scan_all(&["hello ", "world"]), vec![text("hello world")]);
    }

    #[test]
    fn recognises_tags() {
        assert_eq!(
            scan_all(&["a<think>b</think>c"]),
            vec![
                text("a"),
                tag(TagKind::Reasoning, false, "<think>"),
                text("b"),
                tag(TagKind::Reasoning, true, "</think>"),
                text("c"),
            ]
        );
    }

    #[test]
    fn tag_split_across_chunks() {
        assert_eq!(
            scan_all(&["x<fi", "nal>y</", "FINAL>"]),
            vec![
                text("x"),
                tag(TagKind::Final, false, "<final>"),
                text("y"),
                tag(TagKind::Final, true, "</FINAL>"),
            ]
        );
    }

    #[test]
    fn whitespace_inside_brackets() {
        assert_eq!(
            scan_all(&["< /thought >"]),
            vec![tag(TagKind::Reasoning, true, "< /thought >")]
        );
    }

    #[test]
    fn lookalikes_are_text() {
        assert_eq!(scan_all(&["a < b and <div> <thinker>"]), vec![text("a < b and <div> <thinker>")]);
        assert_eq!(scan_all(&["<think class=\"x\">"]), vec![text("<think class=\"x\">")]);
    }

    #[test]
    fn trailing_partial_tag_flushed_at_finish() {
        let mut s = TagScanner::new();
        assert_eq!(s.push("answer <thi"), vec![text("answer ")]);
        assert_eq!(s.finish(), vec![text("<thi")]);
    }

    #[test]
    fn inline_code_is_opaque() {
        assert_eq!(scan_all(&["use `<think>` here"]), vec![text("use `<think>` here")]);
        assert_eq!(
            scan_all(&["``a ` <final> ``", "<final>"]),
            vec![text("``a ` <final> ``"), tag(TagKind::Final, false, "<final>")]
        );
    }

    #[test]
    fn inline_code_split_across_chunks() {
        let mut s = TagScanner::new();
        assert!(s.push("`<thi").is_empty());
        let out = merge_text([s.push("nk>` done"), s.finish()].concat());
        assert_eq!(out, vec![text("`<think>` done")]);
    }

    #[test]
    fn unclosed_inline_code_ends_at_newline() {
        assert_eq!(
            scan_all(&["a `b\n<think>c"]),
            vec![text("a `b\n"), tag(TagKind::Reasoning, false, "<think>"), text("c")]
        );
    }

    #[test]
    fn fenced_block_is_opaque() {
        let input = "before\n```xml\n<think>not a tag</think>\n```\n<final>ok</final>";
        let out = scan_all(&[input]);
        assert_eq!(
            out,
            vec![
                text("before\n```xml\n<think>not a tag</think>\n```\n"),
                tag(TagKind::Final, false, "<final>"),
                text("ok"),
                tag(TagKind::Final, true, "</final>"),
            ]
        );
    }

    #[test]
    fn fence_needs_same_char_and_length() {
        let input = "~~~~\n```\n<think>\n~~~\n<final>\n~~~~\n<final>";
        let out = scan_all(&[input]);
        assert_eq!(
            out,
            vec![
                text("~~~~\n```\n<think>\n~~~\n<final>\n~~~~\n"),
                tag(TagKind::Final, false, "<final>"),
            ]
        );
    }

    #[test]
    fn fence_split_across_chunks() {
        let out = scan_all(&["``", "`\n<think>\n`", "``\n<think>"]);
        assert_eq!(
            out,
            vec![text("```\n<think>\n```\n"), tag(TagKind::Reasoning, false, "<think>")]
        );
    }

    #[test]
    fn indented_four_spaces_is_not_a_fence() {
        let out = scan_all(&["    ```\n<think>"]);
        assert_eq!(out, vec![text("    ```\n"), tag(TagKind::Reasoning, false, "<think>")]);
    }

    #[test]
    fn multibyte_text_survives() {
        assert_eq!(scan_all(&["héllo <", "final>wörld"]), vec![
            text("héllo "),
            tag(TagKind::Final, false, "<final>"),
            text("wörld"),
        ]);
    }
}
