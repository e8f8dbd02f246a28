//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod reconciliation {
    use super::*;

    pub const NAMESPACE: &str = "recon";

    /// Per-user reconciliation history.
    #[derive(Debug, Clone)]
    pub struct StateKey {
        pub user_id: String,
    }

    impl StateKey {
        pub fn new(user_id: impl Into<String>) -> Self {
            Self {
                user_id: user_id.into(),
            }
        }
    }

    impl fmt::Display for StateKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:state:{}", VERSION, NAMESPACE, self.user_id)
        }
    }
}
