//! Worker identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PoolError;

/// Length in bytes of every [`WorkerId`].
pub const ID_LENGTH: usize = 32;

/// Fixed-length identifier naming one decode worker.
///
/// Used both as the shared memory segment name and as the slot owner in the
/// pool's slot table, so it is always exactly [`ID_LENGTH`] lowercase hex
/// characters.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

impl WorkerId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn parse(s: &str) -> Result<Self, PoolError> {
        let valid = s.len() == ID_LENGTH
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(PoolError::InvalidIdentifier(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes as stored in the slot table.
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        // Length is checked on construction.
        self.0
            .as_bytes()
            .try_into()
            .unwrap_or(&[0u8; ID_LENGTH])
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl TryFrom<String> for WorkerId {
    type Error = PoolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> Self {
        id.0
    }
}
