//! UTF-16 environment block construction for `CreateProcessW`.
//!
//! Windows requires Unicode environment blocks to be sorted
//! case-insensitively by name. Duplicate names are resolved by keeping the
//! last occurrence, and the hidden per-drive variables (`=C:=C:\path`)
//! keep their leading `=` as part of the name. The logic is plain string
//! and UTF-16 work, so it stays compiled and tested on every platform.

struct EnvEntry {
    upper_name: String,
    entry: String,
}

#[derive(Debug)]
pub enum EnvBlockError {
    EmbeddedNul(String),
    InvalidEntry(String),
}

impl std::fmt::Display for EnvBlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvBlockError::EmbeddedNul(entry) => {
                write!(f, "environment entry contains NUL: {entry:?}")
            }
            EnvBlockError::InvalidEntry(entry) => {
                write!(f, "invalid environment entry (expected name=value): {entry:?}")
            }
        }
    }
}

impl std::error::Error for EnvBlockError {}

/// A UTF-16 environment block: each entry NUL-terminated, the whole block
/// terminated by one extra NUL. Empty input produces an empty block whose
/// pointer is null, which `CreateProcessW` treats as "inherit".
#[derive(Debug)]
pub struct EnvironmentBlock(Vec<u16>);

impl EnvironmentBlock {
    pub fn as_ptr(&self) -> *const u16 {
        if self.0.is_empty() {
            std::ptr::null()
        } else {
            self.0.as_ptr()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    fn decode_entries(&self) -> Vec<String> {
        self.0
            .split(|&unit| unit == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| String::from_utf16(chunk).expect("valid utf-16 entry"))
            .collect()
    }
}

pub fn build(env: &[String]) -> Result<EnvironmentBlock, EnvBlockError> {
    if env.is_empty() {
        return Ok(EnvironmentBlock(Vec::new()));
    }

    let deduped = deduplicate_case_insensitive(env)?;
    let sorted = sort_entries_by_name(deduped);
    Ok(EnvironmentBlock(encode_utf16_block(&sorted)))
}

fn deduplicate_case_insensitive(env: &[String]) -> Result<Vec<EnvEntry>, EnvBlockError> {
    let mut seen: std::collections::HashMap<String, usize> =
        std::collections::HashMap::with_capacity(env.len());
    let mut entries: Vec<EnvEntry> = Vec::with_capacity(env.len());

    for raw in env {
        if raw.contains('\0') {
            return Err(EnvBlockError::EmbeddedNul(raw.clone()));
        }

        let (name, value) =
            parse_entry(raw).ok_or_else(|| EnvBlockError::InvalidEntry(raw.clone()))?;

        let upper_name = name.to_uppercase();
        let entry = EnvEntry {
            upper_name: upper_name.clone(),
            entry: format!("{name}={value}"),
        };

        if let Some(&index) = seen.get(&upper_name) {
            entries[index] = entry;
        } else {
            seen.insert(upper_name, entries.len());
            entries.push(entry);
        }
    }
    Ok(entries)
}

fn sort_entries_by_name(mut entries: Vec<EnvEntry>) -> Vec<String> {
    entries.sort_by(|a, b| a.upper_name.cmp(&b.upper_name));
    entries.into_iter().map(|entry| entry.entry).collect()
}

fn encode_utf16_block(entries: &[String]) -> Vec<u16> {
    let mut block = Vec::new();
    for entry in entries {
        block.extend(entry.encode_utf16());
        block.push(0);
    }
    block.push(0);
    block
}

/// Splits `name=value`. Hidden variables start with `=` and the name runs
/// through the second `=` (`=C:=C:\path` parses as name `=C:`).
fn parse_entry(entry: &str) -> Option<(&str, &str)> {
    if entry.len() >= 2 && entry.starts_with('=') {
        let idx = entry[1..].find('=')?;
        if idx == 0 {
            return None;
        }
        return Some((&entry[..idx + 1], &entry[idx + 2..]));
    }

    let (name, value) = entry.split_once('=')?;
    if name.is_empty() {
        return None;
    }
    Some((name, value))
}
