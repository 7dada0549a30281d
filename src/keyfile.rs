//! Reader for the grouped key/value configuration format.
//!
//! ```text
//! # comment
//! [servers]
//! object=node1:4711;node2:4711;
//! ```
//!
//! Groups are introduced by `[name]`, entries are `key=value`, and list
//! values are separated by `;` with an optional trailing separator.
//!
//! Values understand the escapes `\s` (space), `\n`, `\t`, `\r`, `\\` and,
//! inside lists, `\;` for a literal separator.  Unescaped whitespace at
//! either end of a value or list element is dropped; escaped whitespace is
//! kept.

use std::collections::HashMap;

use crate::errors::ConfigError;

/// A parsed key file: group name -> key -> raw value.
#[derive(Debug, Default, Clone)]
pub struct KeyFile {
    groups: HashMap<String, HashMap<String, String>>,
}

impl KeyFile {
    /// Parse `text`.  Entries outside any group and malformed lines are
    /// rejected.  A repeated key keeps its last value.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut groups: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| {
                    ConfigError::invalid(format!("line {}: unterminated group header", lineno + 1))
                })?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(ConfigError::invalid(format!(
                        "line {}: empty group name",
                        lineno + 1
                    )));
                }
                groups.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::invalid(format!(
                    "line {}: expected key=value",
                    lineno + 1
                )));
            };
            let Some(group) = current.as_ref() else {
                return Err(ConfigError::invalid(format!(
                    "line {}: key {} outside of any group",
                    lineno + 1,
                    key.trim()
                )));
            };
            groups
                .entry(group.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self { groups })
    }

    /// Whether `group` was declared.
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Scalar value with escapes decoded, or `None` if absent.
    pub fn string(&self, group: &str, key: &str) -> Option<String> {
        let raw = self.groups.get(group)?.get(key)?;
        Some(unescape(raw))
    }

    /// List value split on unescaped `;`.  An empty value yields an empty list.
    pub fn string_list(&self, group: &str, key: &str) -> Option<Vec<String>> {
        let raw = self.groups.get(group)?.get(key)?;
        Some(split_list(raw))
    }

    /// Unsigned integer value.  Absent keys yield `Ok(None)`.
    pub fn u64(&self, group: &str, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.string(group, key) {
            None => Ok(None),
            Some(v) if v.is_empty() => Ok(None),
            Some(v) => v.parse::<u64>().map(Some).map_err(|_| {
                ConfigError::invalid(format!("{group}.{key}: {v:?} is not an unsigned integer"))
            }),
        }
    }
}

/// One decoded character and whether it came from an escape sequence.
type Decoded = (char, bool);

/// Decode escapes in `raw`, splitting on unescaped `;` when `split` is set.
fn decode(raw: &str, split: bool) -> Vec<Vec<Decoded>> {
    let mut items = Vec::new();
    let mut current: Vec<Decoded> = Vec::new();
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('s') => current.push((' ', true)),
                Some('n') => current.push(('\n', true)),
                Some('t') => current.push(('\t', true)),
                Some('r') => current.push(('\r', true)),
                Some('\\') => current.push(('\\', true)),
                Some(';') => current.push((';', true)),
                // Unknown escapes are kept as written.
                Some(other) => {
                    current.push(('\\', false));
                    current.push((other, false));
                }
                None => current.push(('\\', false)),
            },
            ';' if split => items.push(std::mem::take(&mut current)),
            _ => current.push((c, false)),
        }
    }

    // A trailing separator does not start another element.
    if !split || current.iter().any(|&(c, escaped)| escaped || !c.is_whitespace()) {
        items.push(current);
    }
    items
}

/// Drop unescaped whitespace at both ends.
fn finish(item: &[Decoded]) -> String {
    let plain_ws = |&(c, escaped): &Decoded| !escaped && c.is_whitespace();
    let start = item.iter().position(|d| !plain_ws(d)).unwrap_or(item.len());
    let end = item.iter().rposition(|d| !plain_ws(d)).map_or(start, |i| i + 1);
    item[start..end].iter().map(|&(c, _)| c).collect()
}

fn unescape(raw: &str) -> String {
    finish(&decode(raw, false).concat())
}

fn split_list(raw: &str) -> Vec<String> {
    decode(raw, true).iter().map(|item| finish(item)).collect()
}
