use serde::{Deserialize, Serialize};

/// Options for a [`crate::SubscriptionSession`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Number of messages handled at the same time.
    pub max_concurrency: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

impl SessionOptions {
    /// Checks the options for values the session cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be greater than zero".to_string());
        }

        Ok(())
    }
}
