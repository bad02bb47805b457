//! Table naming shared by the lock and the state store

/// Names of the two coordination tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Table holding versioned state records
    pub state_table: String,
    /// Table holding lock records
    pub lock_table: String,
}

impl Config {
    pub const DEFAULT_STATE_TABLE: &'static str = "keel-state";
    pub const DEFAULT_LOCK_TABLE: &'static str = "keel-state-lock";

    pub fn new() -> Self {
        Self {
            state_table: Self::DEFAULT_STATE_TABLE.to_string(),
            lock_table: Self::DEFAULT_LOCK_TABLE.to_string(),
        }
    }

    pub fn with_state_table(mut self, name: impl Into<String>) -> Self {
        self.state_table = name.into();
        self
    }

    pub fn with_lock_table(mut self, name: impl Into<String>) -> Self {
        self.lock_table = name.into();
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
