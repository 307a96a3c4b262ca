//! Identity hashing for apps, tasks and manager configurations
//!
//! Task identity is a content hash: two submissions are the same task exactly
//! when app name, app source and argument values hash equal. Arguments that
//! reference other tasks hash by the referenced task id, not by the
//! not-yet-computed value, which keeps identity recursive but well defined
//! over an acyclic graph.

use blake3::Hasher;

/// Hex length of a task id (128 bits of the blake3 digest).
pub const TASK_ID_LEN: usize = 32;

/// Separator fed between hash inputs. Serialized JSON never contains a raw
/// NUL byte, so concatenation stays unambiguous.
const FIELD_SEP: &[u8] = b"\0";

/// Normalize app source text before hashing.
///
/// Strips the common leading indentation and per-line trailing whitespace.
/// Comments are kept: they are part of the registered source and changing
/// them changes the app identity, exactly like any other edit.
pub fn normalize_source(source: &str) -> String {
    let indent = source
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut normalized: Vec<&str> = source
        .lines()
        .map(|line| line.get(indent..).unwrap_or(line).trim_end())
        .collect();

    while normalized.last().is_some_and(|line| line.is_empty()) {
        normalized.pop();
    }

    normalized.join("\n")
}

fn digest(parts: &[&[u8]]) -> blake3::Hash {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
        hasher.update(FIELD_SEP);
    }
    hasher.finalize()
}

/// Hash of an app's registered source and version, used to detect "same
/// logical app, changed implementation".
pub fn app_hash(source: &str, version: &str) -> String {
    digest(&[normalize_source(source).as_bytes(), version.as_bytes()])
        .to_hex()
        .to_string()
}

/// Content identity of one task: 128-bit hex digest over app name, app hash
/// and the canonical argument blobs.
pub fn task_id(app_name: &str, app_hash: &str, args_blob: &[u8], kwargs_blob: &[u8]) -> String {
    let digest = digest(&[app_name.as_bytes(), app_hash.as_bytes(), args_blob, kwargs_blob]);
    digest.to_hex()[..TASK_ID_LEN].to_string()
}

/// Digest identifying a serialized manager configuration.
pub fn config_hash(blob: &[u8]) -> String {
    digest(&[blob]).to_hex()[..TASK_ID_LEN].to_string()
}

/// Derive a stable positive errno from a failure message.
///
/// The same error message maps to the same value across runs. The result is
/// confined to `1..=125` so it can never collide with the reserved negative
/// scheduler values or with 0.
pub fn stable_errno(message: &str) -> i64 {
    let hash = digest(&[message.as_bytes()]);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    1 + (u64::from_le_bytes(bytes) % 125) as i64
}

/// Whether a string looks like a task id produced by [`task_id`].
pub fn is_task_id(s: &str) -> bool {
    s.len() == TASK_ID_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}
