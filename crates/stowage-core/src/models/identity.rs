use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use crate::ids::{IdParseError, IntegrationId, UserId};

/// Who is acting: a human user or an automated integration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Identity {
    User(UserId),
    Integration(IntegrationId),
}

impl Identity {
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Identity::User(id) => Some(id),
            Identity::Integration(_) => None,
        }
    }

    pub fn integration_id(&self) -> Option<&IntegrationId> {
        match self {
            Identity::Integration(id) => Some(id),
            Identity::User(_) => None,
        }
    }

    /// Rebuild an identity from the two nullable owner columns.
    pub fn from_columns(
        user_id: Option<UserId>,
        integration_id: Option<IntegrationId>,
    ) -> Option<Self> {
        match (user_id, integration_id) {
            (Some(user), _) => Some(Identity::User(user)),
            (None, Some(integration)) => Some(Identity::Integration(integration)),
            (None, None) => None,
        }
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Identity::User(id) => Display::fmt(id, f),
            Identity::Integration(id) => Display::fmt(id, f),
        }
    }
}

impl FromStr for Identity {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(IntegrationId::PREFIX) {
            IntegrationId::parse(s).map(Identity::Integration)
        } else {
            UserId::parse(s).map(Identity::User)
        }
    }
}
