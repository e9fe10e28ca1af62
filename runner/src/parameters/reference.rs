//! Scanner for the parameter reference micro-format.
//!
//! A reference starts with a single `$` followed by either a bare identifier
//! (`$nodes`) or a braced one (`${nodes}`). Two markers in a row (`$$`) stand
//! for one literal `$` and never start a reference. A marker followed by
//! anything else is plain text.

use itertools::Itertools;

pub const MARKER: u8 = b'$';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    /// text without any marker meaning
    Text(&'a str),
    /// an escaped marker (`$$`)
    Escaped,
    /// a reference to another parameter, `raw` is the text as written
    Reference { name: &'a str, raw: &'a str },
}

fn is_identifier(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn identifier_end(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|byte| !is_identifier(*byte))
        .map_or(bytes.len(), |offset| start + offset)
}

fn flush<'a>(segments: &mut Vec<Segment<'a>>, text: &'a str, from: usize, to: usize) {
    if from < to {
        segments.push(Segment::Text(&text[from..to]));
    }
}

/// split expression text into literal text, escapes and references
pub fn segments(text: &str) -> Vec<Segment<'_>> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] != MARKER {
            index += 1;
            continue;
        }

        match bytes.get(index + 1) {
            Some(&MARKER) => {
                flush(&mut segments, text, start, index);
                segments.push(Segment::Escaped);
                index += 2;
                start = index;
            }
            Some(b'{') => {
                let name_start = index + 2;
                let name_end = identifier_end(bytes, name_start);

                if name_end > name_start && bytes.get(name_end) == Some(&b'}') {
                    flush(&mut segments, text, start, index);
                    segments.push(Segment::Reference {
                        name: &text[name_start..name_end],
                        raw: &text[index..=name_end],
                    });
                    index = name_end + 1;
                    start = index;
                } else {
                    // unterminated or empty braces stay literal
                    index += 1;
                }
            }
            Some(byte) if is_identifier(*byte) => {
                let name_end = identifier_end(bytes, index + 1);

                flush(&mut segments, text, start, index);
                segments.push(Segment::Reference {
                    name: &text[index + 1..name_end],
                    raw: &text[index..name_end],
                });
                index = name_end;
                start = index;
            }
            _ => index += 1,
        }
    }

    flush(&mut segments, text, start, bytes.len());

    segments
}

/// names referenced by `text`, in order of first appearance
pub fn references(text: &str) -> Vec<&str> {
    segments(text)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Reference { name, .. } => Some(name),
            _ => None,
        })
        .unique()
        .collect_vec()
}

pub fn has_references(text: &str) -> bool {
    segments(text)
        .iter()
        .any(|segment| matches!(segment, Segment::Reference { .. }))
}

/// double every marker so the value reads as literal text inside an expression
pub fn escape(value: &str) -> String {
    value.replace('$', "$$")
}

/// turn escaped markers back into single ones, references are kept as written
pub fn unescape(text: &str) -> String {
    segments(text)
        .into_iter()
        .fold(String::with_capacity(text.len()), |mut output, segment| {
            match segment {
                Segment::Text(text) => output.push_str(text),
                Segment::Escaped => output.push('$'),
                Segment::Reference { raw, .. } => output.push_str(raw),
            }

            output
        })
}

/// Replace every reference `lookup` knows about with its (escaped) value.
///
/// Escapes are preserved and unknown references keep their original text, so
/// the result can be scanned again to see whether anything is left.
pub fn substitute<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    segments(text)
        .into_iter()
        .fold(String::with_capacity(text.len()), |mut output, segment| {
            match segment {
                Segment::Text(text) => output.push_str(text),
                Segment::Escaped => output.push_str("$$"),
                Segment::Reference { name, raw } => match lookup(name) {
                    Some(value) => output.push_str(&escape(&value)),
                    None => output.push_str(raw),
                },
            }

            output
        })
}
