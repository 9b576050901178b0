//! Typed ID definitions and store bookkeeping numbers.

use crate::define_id;

// =============================================================================
// Resource IDs
// =============================================================================

define_id!(WorkloadId, "wl");
define_id!(RequestId, "req");

// =============================================================================
// Resource Version
// =============================================================================

/// Per-record version used for optimistic concurrency.
///
/// Every committed write to a record produces the next version; a write that
/// names a stale version is rejected by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// The version assigned when a record is first created.
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the version a successful write will assign.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for ResourceVersion {
    fn default() -> Self {
        Self::FIRST
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

impl From<ResourceVersion> for u64 {
    fn from(version: ResourceVersion) -> Self {
        version.0
    }
}

impl serde::Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ResourceVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Self)
    }
}

// =============================================================================
// Revision
// =============================================================================

/// Store-wide, monotonically increasing change position.
///
/// Change feeds resume from the last revision they delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(i64);

impl Revision {
    #[must_use]
    pub const fn new(revision: i64) -> Self {
        Self(revision)
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Revision {
    fn from(revision: i64) -> Self {
        Self(revision)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_id_roundtrip() {
        let id = WorkloadId::new();
        let parsed: WorkloadId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("wl_"));
    }

    #[test]
    fn test_workload_id_wrong_kind() {
        for input in ["req_01HV4Z2WQXKJNM8GPQY6VBKC3D", "wl01HV4Z2WQXKJNM8GPQY6VBKC3D"] {
            assert_eq!(
                input.parse::<WorkloadId>(),
                Err(crate::IdError::WrongKind {
                    kind: "wl",
                    input: input.to_string(),
                })
            );
        }
    }

    #[test]
    fn test_empty_and_bad_ulid() {
        assert_eq!(
            WorkloadId::parse(""),
            Err(crate::IdError::Empty { kind: "wl" })
        );
        let err = WorkloadId::parse("wl_invalid").unwrap_err();
        assert!(matches!(err, crate::IdError::BadUlid { ref input, .. } if input == "wl_invalid"));
        assert!(err.to_string().contains("wl_invalid"));
    }

    #[test]
    fn test_workload_id_json_is_string() {
        let id = WorkloadId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: WorkloadId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_workload_ids_sort_by_creation() {
        let first = WorkloadId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = WorkloadId::new();
        assert!(first < second);
    }

    #[test]
    fn test_resource_version_next() {
        let v = ResourceVersion::FIRST;
        assert_eq!(v.value(), 1);
        assert_eq!(v.next().value(), 2);
        assert!(v < v.next());
    }

    #[test]
    fn test_prefixes_unique() {
        assert_ne!(WorkloadId::PREFIX, RequestId::PREFIX);
    }

    proptest::proptest! {
        #[test]
        fn prop_any_ulid_parses_back(raw in proptest::prelude::any::<u128>()) {
            let id = WorkloadId::from_ulid(crate::Ulid::from(raw));
            proptest::prop_assert_eq!(WorkloadId::parse(&id.to_string()), Ok(id));
        }
    }
}
