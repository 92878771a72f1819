//! Cache key composition.

/// Combines a source's base key with a processor identifier.
///
/// Renditions produced by different processors land under different keys,
/// while the default (empty) identifier keeps the bare base key.
#[must_use]
pub fn computed_key(base_key: &str, processor_identifier: &str) -> String {
    if processor_identifier.is_empty() {
        base_key.to_string()
    } else {
        format!("{base_key}@{processor_identifier}")
    }
}
