//! Entity identity.

use entilink_codec::Value;
use std::fmt;

/// Composite identity of a remote record.
///
/// Two handles with equal, keyed identities represent the same record.
/// Entities created locally have no key until their creation is committed
/// and never compare equal to anything but themselves in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityIdentity {
    /// Schema namespace.
    pub schema: String,
    /// Entity container.
    pub container: String,
    /// Entity set (or singleton name).
    pub entity_set: String,
    /// Qualified type name.
    pub type_name: String,
    /// Server key in literal form, once known.
    pub key: Option<String>,
}

impl EntityIdentity {
    /// Creates an identity.
    pub fn new(
        schema: impl Into<String>,
        container: impl Into<String>,
        entity_set: impl Into<String>,
        type_name: impl Into<String>,
        key: Option<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            container: container.into(),
            entity_set: entity_set.into(),
            type_name: type_name.into(),
            key,
        }
    }

    /// Returns true if the server key is known.
    pub fn is_keyed(&self) -> bool {
        self.key.is_some()
    }

    /// Returns a copy carrying the given key.
    #[must_use]
    pub fn with_key(&self, key: Option<String>) -> Self {
        Self {
            key,
            ..self.clone()
        }
    }
}

impl fmt::Display for EntityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.schema, self.container, self.entity_set)?;
        match &self.key {
            Some(key) => write!(f, "({key})"),
            None => f.write_str("(new)"),
        }
    }
}

/// Renders key values as a key segment.
///
/// A single key renders as its literal (`7`, `'a''b'`); composite keys as
/// `Name=literal` pairs. Returns `None` if any value is null or cannot be
/// used as a key.
pub fn key_literal(parts: &[(&str, Value)]) -> Option<String> {
    match parts {
        [] => None,
        [(_, value)] => value.to_key_literal(),
        _ => {
            let rendered: Option<Vec<String>> = parts
                .iter()
                .map(|(name, value)| value.to_key_literal().map(|lit| format!("{name}={lit}")))
                .collect();
            rendered.map(|pairs| pairs.join(","))
        }
    }
}

/// Extracts the key segment from an address such as `Files(7)`.
pub fn key_from_address(address: &str) -> Option<String> {
    let inner = address.strip_suffix(')')?;
    let open = inner.rfind('(')?;
    let key = &inner[open + 1..];
    (!key.is_empty()).then(|| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_composite_keys() {
        assert_eq!(key_literal(&[("Id", Value::Integer(7))]).as_deref(), Some("7"));
        assert_eq!(
            key_literal(&[("Id", Value::Integer(7)), ("Code", Value::from("x"))]).as_deref(),
            Some("Id=7,Code='x'")
        );
        assert!(key_literal(&[("Id", Value::Null)]).is_none());
        assert!(key_literal(&[]).is_none());
    }

    #[test]
    fn identity_equality_requires_equal_keys() {
        let a = EntityIdentity::new("Docs", "Svc", "Files", "Docs.File", Some("1".into()));
        let b = a.with_key(Some("1".into()));
        let c = a.with_key(Some("2".into()));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "Docs.Svc/Files(1)");
        assert_eq!(a.with_key(None).to_string(), "Docs.Svc/Files(new)");
    }

    #[test]
    fn key_from_address_segment() {
        assert_eq!(key_from_address("Files(7)").as_deref(), Some("7"));
        assert_eq!(key_from_address("Folders(1)/Files(Id=2,Code='x')").as_deref(), Some("Id=2,Code='x'"));
        assert!(key_from_address("Settings").is_none());
        assert!(key_from_address("Files()").is_none());
    }
}
