//! Link protocol version and compatibility rules.

use serde::{Deserialize, Serialize};

/// A `(major, minor, patch)` protocol version triple.
///
/// Ordering is lexicographic. Compatibility is **not** semver: only the
/// versions listed in [`ProtoVersion::COMPATIBLE`] are accepted from an
/// older peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtoVersion(pub [u32; 3]);

impl ProtoVersion {
    /// The protocol version of this implementation.
    pub const CURRENT: Self = Self([0, 1, 0]);

    /// Older versions this implementation still accepts.
    pub const COMPATIBLE: &'static [Self] = &[Self([0, 1, 0])];

    /// Whether a peer announcing this version can talk to us.
    #[must_use]
    pub fn is_compatible(self) -> bool {
        Self::COMPATIBLE.contains(&self)
    }
}

impl std::fmt::Display for ProtoVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_version_is_compatible_with_itself() {
        assert!(ProtoVersion::CURRENT.is_compatible());
    }

    #[test]
    fn unlisted_version_is_incompatible() {
        assert!(!ProtoVersion([0, 0, 9]).is_compatible());
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(ProtoVersion([0, 1, 0]) > ProtoVersion([0, 0, 9]));
        assert!(ProtoVersion([1, 0, 0]) > ProtoVersion([0, 9, 9]));
    }

    #[test]
    fn serializes_as_a_bare_array() {
        let encoded = serde_json::to_string(&ProtoVersion([0, 1, 0])).unwrap();
        assert_eq!(encoded, "[0,1,0]");
        let decoded: ProtoVersion = serde_json::from_str("[2,3,4]").unwrap();
        assert_eq!(decoded, ProtoVersion([2, 3, 4]));
    }

    #[test]
    fn displays_dotted() {
        assert_eq!(ProtoVersion([0, 1, 0]).to_string(), "0.1.0");
    }
}
