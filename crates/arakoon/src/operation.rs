use bytes::Bytes;

/// Read consistency requested from the cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Consistency {
    /// Served by the master.
    #[default]
    Consistent,

    /// Served by any node, possibly stale.
    Inconsistent,

    /// Served by any node that has applied at least the given update index.
    AtLeast(u64),
}

/// One step of an atomic sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Store a value.
    Set {
        /// Target key.
        key: String,
        /// New value.
        value: Bytes,
    },

    /// Remove a key which must exist.
    Delete {
        /// Target key.
        key: String,
    },

    /// Replace a value, removing the key for `None`. Never fails on absence.
    Replace {
        /// Target key.
        key: String,
        /// New value, if any.
        value: Option<Bytes>,
    },

    /// Remove every key starting with a prefix.
    DeletePrefix {
        /// Prefix to remove.
        prefix: String,
    },

    /// Require the current value to equal `value` (absent for `None`).
    Assert {
        /// Checked key.
        key: String,
        /// Expected value.
        value: Option<Bytes>,
    },

    /// Require the key to exist.
    AssertExists {
        /// Checked key.
        key: String,
    },

    /// Require the keys under a prefix to be exactly `keys`.
    AssertRange {
        /// Scanned prefix.
        prefix: String,
        /// Expected keys, in store order.
        keys: Vec<String>,
    },
}

impl Operation {
    /// The key (or prefix) this operation touches.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Delete { key }
            | Self::Replace { key, .. }
            | Self::Assert { key, .. }
            | Self::AssertExists { key } => key,
            Self::DeletePrefix { prefix } | Self::AssertRange { prefix, .. } => prefix,
        }
    }

    /// Whether this operation only checks state.
    #[must_use]
    pub const fn is_assertion(&self) -> bool {
        matches!(
            self,
            Self::Assert { .. } | Self::AssertExists { .. } | Self::AssertRange { .. }
        )
    }
}

/// Bounds of a single range read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeRequest {
    /// First key of the range.
    pub begin: Vec<u8>,

    /// Whether `begin` itself is part of the range.
    pub begin_inclusive: bool,

    /// Upper bound, or `None` for the end of the key space.
    pub end: Option<Vec<u8>>,

    /// Whether `end` itself is part of the range.
    pub end_inclusive: bool,

    /// Maximum number of keys returned.
    pub max_elements: usize,
}

impl RangeRequest {
    /// Whether `key` lies inside the bounds, ignoring `max_elements`.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        let above = if self.begin_inclusive {
            key >= self.begin.as_slice()
        } else {
            key > self.begin.as_slice()
        };
        let below = match &self.end {
            None => true,
            Some(end) if self.end_inclusive => key <= end.as_slice(),
            Some(end) => key < end.as_slice(),
        };
        above && below
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds() {
        let request = RangeRequest {
            begin: b"b".to_vec(),
            begin_inclusive: false,
            end: Some(b"d".to_vec()),
            end_inclusive: false,
            max_elements: 10,
        };

        assert!(!request.contains(b"b"));
        assert!(request.contains(b"ba"));
        assert!(request.contains(b"c"));
        assert!(!request.contains(b"d"));
    }

    #[test]
    fn test_unbounded_range() {
        let request = RangeRequest {
            begin: Vec::new(),
            begin_inclusive: true,
            end: None,
            end_inclusive: false,
            max_elements: 1,
        };

        assert!(request.contains(b""));
        assert!(request.contains(&[0xff, 0xff]));
    }
}
