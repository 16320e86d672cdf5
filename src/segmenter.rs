//! Splits a cleaned generation into delivery units: emoji stickers and utterance-sized
//! text chunks, in source order.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

static SEND_EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[SEND_EMOJI:\s*([^\]]*?)\s*\]\]").expect("emoji marker pattern is valid")
});

/// Sticker names known to the host, mapped to their resource (URL or path).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmojiCatalog {
    entries: HashMap<String, String>,
}

impl EmojiCatalog {
    pub fn insert(&mut self, name: impl Into<String>, resource: impl Into<String>) {
        self.entries.insert(name.into(), resource.into());
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.entries.get(name.trim()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, R: Into<String>> FromIterator<(N, R)> for EmojiCatalog {
    fn from_iter<I: IntoIterator<Item = (N, R)>>(iter: I) -> Self {
        let mut catalog = EmojiCatalog::default();
        for (name, resource) in iter {
            catalog.insert(name, resource);
        }
        catalog
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryUnit {
    Text(String),
    Emoji { name: String, resource: String },
}

pub fn segment(text: &str, catalog: &EmojiCatalog) -> Vec<DeliveryUnit> {
    let mut units = Vec::new();
    let mut last = 0;

    for caps in SEND_EMOJI.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        push_text(&mut units, &text[last..whole.start()]);
        last = whole.end();

        let name = caps[1].trim();
        match catalog.resolve(name) {
            Some(resource) => units.push(DeliveryUnit::Emoji {
                name: name.to_string(),
                resource: resource.to_string(),
            }),
            None => debug!("Segmenter: unknown emoji '{}' dropped", name),
        }
    }
    push_text(&mut units, &text[last..]);
    units
}

fn push_text(units: &mut Vec<DeliveryUnit>, segment: &str) {
    if segment.trim().is_empty() {
        return;
    }
    let chunks = split_utterances(segment);
    if chunks.is_empty() {
        units.push(DeliveryUnit::Text(segment.trim().to_string()));
    } else {
        units.extend(chunks.into_iter().map(DeliveryUnit::Text));
    }
}

/// Splits text on sentence-final punctuation, newline runs and whitespace between CJK
/// characters. Ellipses and `[[...]]` markers are never split.
pub fn split_utterances(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < n {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        // [[...]] marker
        if c == '[' && next == Some('[') {
            if let Some(end) = find_marker_end(&chars, i + 2) {
                current.extend(&chars[i..end]);
                i = end;
                continue;
            }
        }

        if c == '\n' || c == '\r' {
            flush(&mut current, &mut chunks);
            while i < n && (chars[i] == '\n' || chars[i] == '\r') {
                i += 1;
            }
            continue;
        }

        let run = run_length(&chars, i, c);
        let is_ellipsis = match c {
            '…' => true,
            '.' => run >= 2,
            '。' => run >= 3,
            _ => false,
        };
        if is_ellipsis {
            current.extend(&chars[i..i + run]);
            i += run;
            continue;
        }

        if is_terminal(c) {
            if c == '.' && !latin_period_ends_sentence(next) {
                current.push(c);
                i += 1;
                continue;
            }
            while i < n && is_terminal(chars[i]) {
                current.push(chars[i]);
                i += 1;
            }
            while i < n && is_closing(chars[i]) {
                current.push(chars[i]);
                i += 1;
            }
            flush(&mut current, &mut chunks);
            continue;
        }

        if c.is_whitespace() {
            let mut end = i;
            while end < n
                && chars[end].is_whitespace()
                && chars[end] != '\n'
                && chars[end] != '\r'
            {
                end += 1;
            }
            let before_cjk = current.chars().last().is_some_and(is_cjk);
            let after_cjk = chars.get(end).copied().is_some_and(is_cjk);
            if before_cjk && after_cjk {
                flush(&mut current, &mut chunks);
            } else {
                current.extend(&chars[i..end]);
            }
            i = end;
            continue;
        }

        current.push(c);
        i += 1;
    }

    flush(&mut current, &mut chunks);
    chunks
}

fn flush(current: &mut String, chunks: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
    current.clear();
}

/// Index just past the `]]` closing a marker whose body starts at `from`.
fn find_marker_end(chars: &[char], from: usize) -> Option<usize> {
    (from..chars.len().saturating_sub(1))
        .find(|&j| chars[j] == ']' && chars[j + 1] == ']')
        .map(|j| j + 2)
}

fn run_length(chars: &[char], start: usize, c: char) -> usize {
    chars[start..].iter().take_while(|&&x| x == c).count()
}

fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | ';' | '。' | '！' | '？' | '；')
}

fn is_closing(c: char) -> bool {
    matches!(
        c,
        '"' | '\'' | ')' | '”' | '’' | '）' | '」' | '』' | '】' | '》' | '〉'
    )
}

/// `3.14` and `example.com` keep their period; `end.` and `end.你` do not.
fn latin_period_ends_sentence(next: Option<char>) -> bool {
    match next {
        None => true,
        Some(c) => c.is_whitespace() || is_closing(c) || is_cjk(c),
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30FF}'   // kana
        | '\u{3400}'..='\u{4DBF}' // extension A
        | '\u{4E00}'..='\u{9FFF}' // unified ideographs
        | '\u{AC00}'..='\u{D7AF}' // hangul
        | '\u{3001}'..='\u{303F}' // CJK punctuation
        | '\u{FF01}'..='\u{FF60}' // fullwidth forms
    )
}
