//! Citation extraction for assistant answers.
//!
//! Answers reference retrieved documents with inline `[docN]` markers, `N` being
//! the 1-based position in the citation list of the preceding tool message.

use crate::models::{Citation, Message, Role, ToolMessageContent};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::ops::Range;

static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[doc(\d{1,3})\]").expect("invalid marker regex"));

// Value of a `src` attribute inside an `<img>` tag: double-quoted, single-quoted or bare
static IMG_SRC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\ssrc\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s/>]+))"#)
        .expect("invalid image regex")
});

/// Answer text with markers rewritten, plus the citations it actually uses.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAnswer {
    pub display_text: String,
    pub citations: Vec<Citation>,
}

/// A `[docN]` marker found in an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Marker<'a> {
    text: &'a str,
    digits: &'a str,
}

fn find_markers(answer: &str) -> Vec<Marker<'_>> {
    MARKER_RE
        .captures_iter(answer)
        .filter_map(|caps| {
            Some(Marker {
                text: caps.get(0)?.as_str(),
                digits: caps.get(1)?.as_str(),
            })
        })
        .collect()
}

/// Numbers citations that share a file path 1, 2, ... in list order.
pub fn enumerate_citations(citations: &mut [Citation]) {
    let mut parts: HashMap<Option<String>, u32> = HashMap::new();
    for citation in citations.iter_mut() {
        let part = parts.entry(citation.filepath.clone()).or_insert(0);
        *part += 1;
        citation.part_index = Some(*part);
    }
}

/// Rewrites `[docN]` markers to `^k^` footnotes and returns the cited documents
/// in first-reference order, `k` counting from 1.
///
/// Each distinct marker is replaced everywhere at its first encounter. Markers
/// pointing past the end of `citations` are left in the text.
pub fn parse_answer(answer: &str, citations: &[Citation]) -> ParsedAnswer {
    let mut display_text = answer.to_string();
    let mut cited: Vec<Citation> = Vec::new();

    for marker in find_markers(answer) {
        if cited.iter().any(|c| c.id.as_deref() == Some(marker.digits)) {
            continue;
        }
        let Some(source) = marker
            .digits
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| citations.get(i))
        else {
            log::debug!("Skipping citation marker {} with no matching document", marker.text);
            continue;
        };

        let reindex = cited.len() + 1;
        display_text = display_text.replace(marker.text, &format!("^{}^", reindex));

        let mut citation = source.clone();
        citation.id = Some(marker.digits.to_string());
        citation.reindex_id = Some(reindex.to_string());
        cited.push(citation);
    }

    enumerate_citations(&mut cited);
    ParsedAnswer {
        display_text,
        citations: cited,
    }
}

/// Citations carried by a tool message. Anything else, or an undecodable
/// payload, yields none.
pub fn parse_tool_citations(message: &Message) -> Vec<Citation> {
    if message.role != Role::Tool {
        return Vec::new();
    }
    match serde_json::from_str::<ToolMessageContent>(&message.content) {
        Ok(content) => content.citations,
        Err(e) => {
            log::warn!("Could not decode tool message {}: {}", message.id, e);
            Vec::new()
        }
    }
}

/// Parses an assistant answer against the tool message just before it in the
/// transcript, if there is one.
pub fn parse_transcript_answer(messages: &[Message], index: usize) -> Option<ParsedAnswer> {
    let answer = messages.get(index)?;
    if answer.role != Role::Assistant {
        return None;
    }
    let citations = index
        .checked_sub(1)
        .and_then(|i| messages.get(i))
        .map(parse_tool_citations)
        .unwrap_or_default();
    Some(parse_answer(&answer.content, &citations))
}

/// `src` attribute of an `<img>` tag within citation HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    /// Byte range of the attribute value, quotes excluded.
    pub span: Range<usize>,
    pub src: String,
}

impl ImageSource {
    /// File name the blob store knows the image by.
    pub fn blob_name(&self) -> &str {
        self.src.rsplit('/').next().unwrap_or(&self.src)
    }
}

/// Finds every `<img ... src=...>` value in `html`.
pub fn image_sources(html: &str) -> Vec<ImageSource> {
    IMG_SRC_RE
        .captures_iter(html)
        .filter_map(|caps| {
            let value = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3))?;
            Some(ImageSource {
                span: value.range(),
                src: value.as_str().to_string(),
            })
        })
        .collect()
}

/// Replaces the given byte ranges of `html`. Ranges must not overlap.
pub fn replace_spans(html: &str, replacements: &[(Range<usize>, String)]) -> String {
    let mut ordered: Vec<&(Range<usize>, String)> = replacements.iter().collect();
    ordered.sort_by_key(|(span, _)| span.start);

    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;
    for (span, value) in ordered {
        out.push_str(&html[cursor..span.start]);
        out.push_str(value);
        cursor = span.end;
    }
    out.push_str(&html[cursor..]);
    out
}
