//! Datastore version identifiers.

use std::fmt;

/// One of the five logical containers of the topology datastore.
///
/// Northbound configuration writes land only in `Candidate`. `Running` is the last committed
/// configuration, `Startup` the persisted boot image, `State` holds southbound-derived
/// operational data, and `Import` is the scratch snapshot used by controller audit and
/// configuration import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DatastoreVersion {
    /// Uncommitted northbound configuration.
    Candidate,
    /// Last committed configuration.
    Running,
    /// Persisted boot image.
    Startup,
    /// Southbound operational data.
    State,
    /// Per-controller scratch snapshot.
    Import,
}

impl DatastoreVersion {
    /// All versions in storage order.
    pub const ALL: [Self; 5] = [
        Self::Candidate,
        Self::Running,
        Self::Startup,
        Self::State,
        Self::Import,
    ];

    /// Dense index used by table arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Candidate => 0,
            Self::Running => 1,
            Self::Startup => 2,
            Self::State => 3,
            Self::Import => 4,
        }
    }

    /// Uppercase label used in logs and responses.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Candidate => "CANDIDATE",
            Self::Running => "RUNNING",
            Self::Startup => "STARTUP",
            Self::State => "STATE",
            Self::Import => "IMPORT",
        }
    }
}

impl fmt::Display for DatastoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
