use std::fmt::Display;

use uuid::Uuid;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Placeholder for the domain name in domain templates.
pub const NAME_KEY: &str = "NAME";

/// Placeholder for the disk image path.
pub const IMAGE_PATH_KEY: &str = "IMAGE_PATH";

/// Placeholder for the per-render unique identifier.
pub const UUID_KEY: &str = "UUID";

/// Placeholder for the owning domain's name in snapshot templates.
pub const DOMAIN_NAME_KEY: &str = "DOMAIN_NAME";

/// Placeholder for the snapshot name in snapshot templates.
pub const SNAPSHOT_NAME_KEY: &str = "SNAPSHOT_NAME";

/// Placeholder for the snapshot creation time, in seconds since the Unix epoch.
pub const CREATION_TIME_KEY: &str = "CREATION_TIME";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The substitution values for one render of a [`Template`](super::Template).
///
/// Every value set is created with a fresh `UUID` entry so two renders never share an
/// identifier. Keys are stored without the leading `$`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateValues {
    entries: Vec<(String, String)>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TemplateValues {
    /// Creates a value set holding only a freshly generated `UUID`.
    pub fn new() -> Self {
        let mut values = Self {
            entries: Vec::new(),
        };
        values.insert(UUID_KEY, Uuid::new_v4());
        values
    }

    /// Values for a domain definition: `NAME`, `IMAGE_PATH` and a fresh `UUID`.
    pub fn for_domain(name: &str, image_path: &str) -> Self {
        Self::new()
            .with(NAME_KEY, name)
            .with(IMAGE_PATH_KEY, image_path)
    }

    /// Values for a snapshot definition: `DOMAIN_NAME`, `SNAPSHOT_NAME`, `IMAGE_PATH`,
    /// `CREATION_TIME` and a fresh `UUID`.
    pub fn for_snapshot(
        domain_name: &str,
        snapshot_name: &str,
        image_path: &str,
        creation_time: i64,
    ) -> Self {
        Self::new()
            .with(DOMAIN_NAME_KEY, domain_name)
            .with(SNAPSHOT_NAME_KEY, snapshot_name)
            .with(IMAGE_PATH_KEY, image_path)
            .with(CREATION_TIME_KEY, creation_time)
    }

    /// Sets a value, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Display) {
        let key = key.into();
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Display) -> Self {
        self.insert(key, value);
        self
    }

    /// Returns the value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the generated identifier for this value set.
    pub fn uuid(&self) -> Option<&str> {
        self.get(UUID_KEY)
    }

    /// Iterates over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for TemplateValues {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_have_fresh_uuid() {
        let a = TemplateValues::new();
        let b = TemplateValues::new();

        let a = a.uuid().unwrap();
        let b = b.uuid().unwrap();
        assert!(Uuid::parse_str(a).is_ok());
        assert_ne!(a, b);
    }

    #[test]
    fn test_values_insert_replaces() {
        let mut values = TemplateValues::new();
        values.insert(NAME_KEY, "first");
        values.insert(NAME_KEY, "second");

        assert_eq!(values.get(NAME_KEY), Some("second"));
        assert_eq!(values.iter().filter(|(k, _)| *k == NAME_KEY).count(), 1);
    }

    #[test]
    fn test_snapshot_values() {
        let values = TemplateValues::for_snapshot("vm", "main", "/images/a.qcow2", 1700000000);

        assert_eq!(values.get(DOMAIN_NAME_KEY), Some("vm"));
        assert_eq!(values.get(SNAPSHOT_NAME_KEY), Some("main"));
        assert_eq!(values.get(IMAGE_PATH_KEY), Some("/images/a.qcow2"));
        assert_eq!(values.get(CREATION_TIME_KEY), Some("1700000000"));
        assert!(values.uuid().is_some());
    }
}
