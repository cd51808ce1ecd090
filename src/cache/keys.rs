//! Cache key builders
//!
//! Keys are versioned so a format change never reads stale shapes.

use std::fmt;

const VERSION: &str = "v1";

pub mod mpesa {
    use super::*;

    /// Shared OAuth access token for one consumer key
    #[derive(Debug, Clone)]
    pub struct AccessTokenKey {
        consumer_key: String,
    }

    impl AccessTokenKey {
        pub fn new(consumer_key: impl Into<String>) -> Self {
            Self {
                consumer_key: consumer_key.into(),
            }
        }
    }

    impl fmt::Display for AccessTokenKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:mpesa:token:{}", VERSION, self.consumer_key)
        }
    }
}
