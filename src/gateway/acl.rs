// =============================================================================
// Channel ACL -- role to allowed channel prefixes
// =============================================================================

use serde::{Deserialize, Serialize};

/// Connection role, resolved from the bearer token at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    /// Channel prefixes this role may subscribe to.
    pub fn allowed_prefixes(self) -> &'static [&'static str] {
        match self {
            Role::User => &["market:", "indicators:"],
            Role::Admin => &["market:", "indicators:", "engine:", "trading:"],
        }
    }

    /// Whether a subscription pattern falls inside the allowed prefixes.
    ///
    /// The check is on the literal prefix of the pattern, so `market:tick:*`
    /// passes for `market:` while a bare `**` passes for nothing.
    pub fn allows(self, pattern: &str) -> bool {
        self.allowed_prefixes()
            .iter()
            .any(|prefix| pattern.starts_with(prefix))
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Admin => write!(f, "admin"),
        }
    }
}
