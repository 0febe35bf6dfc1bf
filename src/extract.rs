//! Best-effort extraction of structured data from free-form model output.
//!
//! Models wrap JSON in code fences, prepend chatter, leave trailing commas or
//! stop mid-object when they hit an output limit. [`extract`] tries a strict
//! parse first, then isolates the outermost container and applies a small set
//! of syntactic repairs before giving up.

use serde::Deserialize;
use serde_json::Value;

/// Outcome of [`extract`].
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// The text was valid JSON as-is.
    Parsed(Value),
    /// The text parsed after isolating or repairing the container.
    Repaired(Value),
    /// Nothing usable was found.
    Failed,
}

impl Extraction {
    /// The extracted value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Extraction::Parsed(value) | Extraction::Repaired(value) => Some(value),
            Extraction::Failed => None,
        }
    }
}

/// Openers tried before giving up on a response.
const MAX_CANDIDATES: usize = 32;

/// Extracts a JSON value from model output.
///
/// Every `{` or `[` is a candidate container start, tried left to right. The
/// first candidate that decodes to an object, or to an array of objects, wins;
/// bracketed chatter such as `[cite: 3]` ahead of the payload is skipped.
pub fn extract(text: &str) -> Extraction {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Extraction::Failed;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Extraction::Parsed(value);
    }

    let unfenced = strip_fences(trimmed);
    let mut scalar_fallback = None;
    let openers = unfenced
        .bytes()
        .enumerate()
        .filter(|(_, b)| *b == b'{' || *b == b'[')
        .map(|(idx, _)| idx)
        .take(MAX_CANDIDATES);
    for start in openers {
        let Some(value) = parse_container(&unfenced, start) else {
            continue;
        };
        if is_structured(&value) {
            return Extraction::Repaired(value);
        }
        scalar_fallback.get_or_insert(value);
    }
    scalar_fallback.map_or(Extraction::Failed, Extraction::Repaired)
}

fn parse_container(text: &str, start: usize) -> Option<Value> {
    let container = Container::locate(text, start);
    let slice = &text[container.start..container.end];
    if container.closers.is_empty() {
        if let Ok(value) = serde_json::from_str::<Value>(slice) {
            return Some(value);
        }
    }
    serde_json::from_str(&repair(slice, &container)).ok()
}

fn is_structured(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => !items.is_empty() && items.iter().all(Value::is_object),
        _ => false,
    }
}

fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `{...}` or `[...]` span opened at a given byte, with the closers still
/// missing when the text ends before the container does.
#[derive(Debug)]
struct Container {
    start: usize,
    end: usize,
    closers: Vec<u8>,
    open_string: bool,
}

impl Container {
    fn locate(text: &str, start: usize) -> Self {
        let bytes = text.as_bytes();
        let mut stack: Vec<u8> = Vec::new();
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &byte) in bytes[start..].iter().enumerate() {
            if in_string {
                match byte {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' => stack.push(b'}'),
                b'[' => stack.push(b']'),
                b'}' | b']' => {
                    if stack.last() == Some(&byte) {
                        stack.pop();
                    }
                    if stack.is_empty() {
                        return Self {
                            start,
                            end: start + offset + 1,
                            closers: Vec::new(),
                            open_string: false,
                        };
                    }
                }
                _ => {}
            }
        }
        stack.reverse();
        Self {
            start,
            end: text.len(),
            closers: stack,
            open_string: in_string,
        }
    }
}

fn repair(slice: &str, container: &Container) -> String {
    let mut out = String::with_capacity(slice.len() + container.closers.len() + 1);
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = slice.chars().collect();
    for (idx, &ch) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => out.push(' '),
                c => out.push(c),
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' if next_significant(&chars[idx + 1..]).map_or(false, |c| c == '}' || c == ']') => {}
            c if c.is_control() && !c.is_whitespace() => {}
            c => out.push(c),
        }
    }

    if container.closers.is_empty() {
        return out;
    }
    if escaped {
        out.pop();
    }
    if container.open_string || in_string {
        out.push('"');
    }
    let trimmed_len = out.trim_end_matches(|c: char| c.is_whitespace() || c == ',').len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.push_str("null");
    }
    for closer in &container.closers {
        out.push(char::from(*closer));
    }
    out
}

fn next_significant(rest: &[char]) -> Option<char> {
    rest.iter().copied().find(|c| !c.is_whitespace())
}

/// One entry of the expected response array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AugmentedItem {
    /// 1-based position of the source record in the batch, when the model gave one.
    pub original_id: Option<usize>,
    /// Question/answer pairs proposed for that record.
    pub variants: Vec<VariantPayload>,
}

/// Question/answer pair as emitted by the model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariantPayload {
    /// Question text.
    #[serde(alias = "question")]
    pub soru: String,
    /// Answer text.
    #[serde(alias = "answer")]
    pub cevap: String,
}

/// Interprets an extracted value as the augmentation schema.
///
/// Accepts `{"augmented_data": [...]}` or a bare array. Entries and variants
/// that do not fit the schema are dropped individually. Returns `None` when
/// the value has neither shape.
pub fn augmented_items(value: &Value) -> Option<Vec<AugmentedItem>> {
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(map) => match map.get("augmented_data") {
            Some(Value::Array(entries)) => entries,
            _ => return None,
        },
        _ => return None,
    };
    let items = entries
        .iter()
        .filter_map(|entry| {
            let map = entry.as_object()?;
            let original_id = map
                .get("original_id")
                .and_then(|id| match id {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                })
                .map(|id| id as usize);
            let variants = map
                .get("variants")
                .and_then(Value::as_array)
                .map(|variants| {
                    variants
                        .iter()
                        .filter_map(|v| serde_json::from_value(v.clone()).ok())
                        .collect()
                })
                .unwrap_or_default();
            Some(AugmentedItem {
                original_id,
                variants,
            })
        })
        .collect();
    Some(items)
}
