//! Client identifier generation

use uuid::Uuid;

/// Generate a fresh random client identifier.
///
/// Identifiers are version-4 UUIDs in hyphenated form, so two sessions
/// started without an explicit identifier never collide on the broker.
pub fn new_identifier() -> String {
    Uuid::new_v4().to_string()
}
