//! Operator identity lookup.
//!
//! The core trusts its caller to have authorized an action; it only needs to
//! know who the acting operator is so transitions can be attributed.

use crate::constants::SYSTEM_OPERATOR;

pub trait IdentityProvider: Send + Sync {
    /// Id of the operator performing the current request
    fn current_operator(&self) -> String;

    /// Identity used for transitions the engine performs on its own
    fn system_operator(&self) -> String {
        SYSTEM_OPERATOR.to_string()
    }
}

/// Identity provider that always reports the same operator
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    operator: String,
}

impl StaticIdentity {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
        }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_OPERATOR)
    }
}

impl Default for StaticIdentity {
    fn default() -> Self {
        Self::system()
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_operator(&self) -> String {
        self.operator.clone()
    }
}
