//! Tagged external identifiers.
//!
//! Every entity exposed outside the process is addressed by a prefixed string id
//! (`w_…`, `fi_…`, …). Each kind is its own newtype so a folder id can never be
//! passed where a file id is expected, and parsing rejects ids of the wrong kind.

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Length of the random part of a freshly generated id.
const ID_SUFFIX_LEN: usize = 20;
/// Upper bound on the random part accepted when parsing.
const MAX_ID_SUFFIX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("identifier `{value}` must start with `{expected}`")]
    WrongPrefix {
        value: String,
        expected: &'static str,
    },
    #[error("identifier `{0}` has an empty or oversized body")]
    BadLength(String),
    #[error("identifier `{0}` contains characters other than ASCII letters and digits")]
    BadCharacters(String),
}

pub(crate) fn random_suffix(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn validate(prefix: &'static str, value: &str) -> Result<(), IdParseError> {
    let body = value
        .strip_prefix(prefix)
        .ok_or_else(|| IdParseError::WrongPrefix {
            value: value.to_string(),
            expected: prefix,
        })?;
    if body.is_empty() || body.len() > MAX_ID_SUFFIX_LEN {
        return Err(IdParseError::BadLength(value.to_string()));
    }
    if !body.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(IdParseError::BadCharacters(value.to_string()));
    }
    Ok(())
}

macro_rules! tagged_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
        #[cfg_attr(feature = "sqlx", sqlx(transparent))]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Generate a fresh random id.
            pub fn new() -> Self {
                Self(format!("{}{}", $prefix, random_suffix(ID_SUFFIX_LEN)))
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                validate($prefix, value)?;
                Ok(Self(value.to_string()))
            }

            pub fn try_parse(value: &str) -> Option<Self> {
                Self::parse(value).ok()
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdParseError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                validate($prefix, &value)?;
                Ok(Self(value))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

tagged_id!(
    /// Workspace (tenant) identifier.
    WorkspaceId,
    "w_"
);
tagged_id!(FolderId, "fo_");
tagged_id!(
    /// Identifier of a completed, durable file.
    FileId,
    "fi_"
);
tagged_id!(
    /// Identifier of an in-progress upload.
    FileUploadId,
    "fu_"
);
tagged_id!(StorageId, "s_");
tagged_id!(UserId, "u_");
tagged_id!(IntegrationId, "i_");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_their_prefix_and_parse_back() {
        let id = FileUploadId::new();
        assert!(id.as_str().starts_with("fu_"));
        assert_eq!(FileUploadId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn parse_rejects_other_kinds() {
        let file = FileId::new();
        assert!(matches!(
            FolderId::parse(file.as_str()),
            Err(IdParseError::WrongPrefix { expected: "fo_", .. })
        ));
        assert!(WorkspaceId::try_parse("s_abc").is_none());
    }

    #[test]
    fn parse_rejects_empty_and_garbage_bodies() {
        assert!(matches!(
            StorageId::parse("s_"),
            Err(IdParseError::BadLength(_))
        ));
        assert!(matches!(
            StorageId::parse("s_../../etc"),
            Err(IdParseError::BadCharacters(_))
        ));
        let oversized = format!("u_{}", "a".repeat(MAX_ID_SUFFIX_LEN + 1));
        assert!(UserId::try_parse(&oversized).is_none());
    }

    #[test]
    fn serde_validates_on_deserialize() {
        let ok: WorkspaceId = serde_json::from_str("\"w_abc123\"").unwrap();
        assert_eq!(ok.to_string(), "w_abc123");
        assert!(serde_json::from_str::<WorkspaceId>("\"fi_abc123\"").is_err());
        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"w_abc123\"");
    }

    #[test]
    fn from_str_round_trips_display() {
        let id: IntegrationId = "i_Zx9".parse().unwrap();
        assert_eq!(id.to_string(), "i_Zx9");
    }
}
