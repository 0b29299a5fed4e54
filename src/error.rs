//! Error types for [`PersistentTreeMap`](crate::PersistentTreeMap).

use std::error::Error;
use std::fmt;

/// A red-black invariant breach detected by
/// [`validate`](crate::PersistentTreeMap::validate).
///
/// These are internal-consistency failures: a correctly functioning map
/// never produces one. The variants identify the first invariant found
/// broken during a single tree walk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StructuralViolation {
    /// The root node is red.
    RedRoot,
    /// A red node has a red child.
    RedRedViolation,
    /// Two paths from the same node pass through different numbers of
    /// black nodes.
    UnequalBlackHeight,
}

impl fmt::Display for StructuralViolation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RedRoot => write!(formatter, "root is red"),
            Self::RedRedViolation => write!(formatter, "red node with red child"),
            Self::UnequalBlackHeight => write!(formatter, "unequal black height"),
        }
    }
}

impl Error for StructuralViolation {}

/// Errors surfaced by the fallible map operations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TreeMapError {
    /// The requested key is not present in the map.
    KeyNotFound,
    /// A red-black invariant does not hold.
    Structural(StructuralViolation),
}

impl fmt::Display for TreeMapError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound => write!(formatter, "key not found"),
            Self::Structural(violation) => write!(formatter, "structural violation: {violation}"),
        }
    }
}

impl Error for TreeMapError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::KeyNotFound => None,
            Self::Structural(violation) => Some(violation),
        }
    }
}

impl From<StructuralViolation> for TreeMapError {
    fn from(violation: StructuralViolation) -> Self {
        Self::Structural(violation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_structural_violation_display() {
        assert_eq!(StructuralViolation::RedRoot.to_string(), "root is red");
        assert_eq!(
            StructuralViolation::RedRedViolation.to_string(),
            "red node with red child"
        );
        assert_eq!(
            StructuralViolation::UnequalBlackHeight.to_string(),
            "unequal black height"
        );
    }

    #[rstest]
    fn test_tree_map_error_display() {
        assert_eq!(TreeMapError::KeyNotFound.to_string(), "key not found");
        assert_eq!(
            TreeMapError::Structural(StructuralViolation::RedRoot).to_string(),
            "structural violation: root is red"
        );
    }

    #[rstest]
    fn test_tree_map_error_source() {
        use std::error::Error;
        assert!(TreeMapError::KeyNotFound.source().is_none());
        assert!(
            TreeMapError::from(StructuralViolation::RedRoot)
                .source()
                .is_some()
        );
    }
}
