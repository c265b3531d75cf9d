use serde::{Deserialize, Serialize};

/// Version number of a stored record, used for optimistic concurrency control.
///
/// A record that does not exist is at version 0. The first write produces
/// version 1 and every successful write increments it by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// The version of a record that has never been written.
    pub fn initial() -> Self {
        Self(0)
    }

    /// The version produced by the first write.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the version that the next write will produce.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A stored value together with the version it was read at.
///
/// Pass `version` back as the expected version of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: Version) -> Self {
        Self { value, version }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}
