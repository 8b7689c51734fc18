/// Default cap on a record value, in bytes.
pub const DEFAULT_MAX_VALUE_BYTES: usize = 1024 * 1024;

/// Record service limits.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Largest accepted value for create and update, in bytes.
    pub max_value_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
        }
    }
}
