//! Partition keys and partition groups.
//!
//! Every write operation carries a [`PartitionKey`]. A [`GroupRouter`] maps
//! keys to a [`GroupKey`]; the batch controller runs one lane per group, so
//! operations in the same group are batched together and dispatched in order.

use std::collections::hash_map::DefaultHasher;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

/// A key used for routing write operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionKey {
  /// String-based key.
  String(String),
  /// Numeric key.
  Numeric(u64),
  /// Raw bytes key.
  Bytes(Vec<u8>),
}

impl From<String> for PartitionKey {
  fn from(s: String) -> Self {
    PartitionKey::String(s)
  }
}

impl From<&str> for PartitionKey {
  fn from(s: &str) -> Self {
    PartitionKey::String(s.to_string())
  }
}

impl From<u64> for PartitionKey {
  fn from(n: u64) -> Self {
    PartitionKey::Numeric(n)
  }
}

impl From<Vec<u8>> for PartitionKey {
  fn from(bytes: Vec<u8>) -> Self {
    PartitionKey::Bytes(bytes)
  }
}

impl Display for PartitionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PartitionKey::String(s) => f.write_str(s),
      PartitionKey::Numeric(n) => write!(f, "{}", n),
      PartitionKey::Bytes(bytes) => {
        for byte in bytes {
          write!(f, "{:02x}", byte)?;
        }
        Ok(())
      }
    }
  }
}

/// Identifies one partition group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(String);

impl GroupKey {
  /// Creates a group key.
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  /// Group name.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Display for GroupKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for GroupKey {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

/// Maps partition keys to partition groups.
///
/// Must be deterministic: the same key always lands in the same group.
pub trait GroupRouter: Send + Sync + 'static {
  /// Returns the group for `key`.
  fn route(&self, key: &PartitionKey) -> GroupKey;
}

/// One group per distinct partition key.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyRouter;

impl GroupRouter for KeyRouter {
  fn route(&self, key: &PartitionKey) -> GroupKey {
    GroupKey(key.to_string())
  }
}

/// Hashes keys into a fixed number of groups named `group-0` .. `group-{n-1}`.
#[derive(Debug, Clone, Copy)]
pub struct HashRouter {
  groups: usize,
}

impl HashRouter {
  /// Creates a router over `groups` groups. Zero is treated as one.
  #[must_use]
  pub fn new(groups: usize) -> Self {
    Self {
      groups: groups.max(1),
    }
  }

  /// Number of groups.
  pub fn groups(&self) -> usize {
    self.groups
  }

  /// Index of the group `key` lands in.
  pub fn index(&self, key: &PartitionKey) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % self.groups
  }
}

impl GroupRouter for HashRouter {
  fn route(&self, key: &PartitionKey) -> GroupKey {
    GroupKey(format!("group-{}", self.index(key)))
  }
}
