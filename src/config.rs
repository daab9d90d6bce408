//! Configuration options for a handler engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest single allocation the host accepts (1 GB - 1).
pub const MAX_ALLOC_SIZE: usize = 0x3fff_ffff;

/// Maximum number of array dimensions the host supports.
pub const MAX_ARRAY_DIMS: usize = 6;

/// Configuration options for creating an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Run scripts in the restricted sandbox: limited standard library,
    /// read-only globals, `setshared` to publish values.
    /// Default: true
    pub trusted: bool,

    /// Allocation ceiling used by array size checks (in bytes).
    /// Default: 0x3fffffff
    pub max_alloc_size: usize,

    /// Maximum number of array dimensions.
    /// Default: 6
    pub max_array_dims: usize,

    /// Maximum nesting depth accepted when reading script tables.
    /// Default: 64
    pub max_table_depth: usize,

    /// Number of rows prefetched per round trip by cursor iterators.
    /// Default: 50
    pub fetch_size: usize,

    /// Maximum wall-clock time a single invocation may run.
    /// Default: None (no limit)
    pub timeout: Option<Duration>,

    /// Chunk name reported in script error messages.
    /// Default: "pllua chunk"
    pub chunk_name: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            trusted: true,
            max_alloc_size: MAX_ALLOC_SIZE,
            max_array_dims: MAX_ARRAY_DIMS,
            max_table_depth: 64,
            fetch_size: 50,
            timeout: None,
            chunk_name: "pllua chunk".to_string(),
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads options from a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let options: Options = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Sets whether scripts run in the restricted sandbox.
    pub fn trusted(mut self, value: bool) -> Self {
        self.trusted = value;
        self
    }

    /// Sets the allocation ceiling.
    pub fn max_alloc_size(mut self, size: usize) -> Self {
        self.max_alloc_size = size;
        self
    }

    /// Sets the maximum number of array dimensions.
    pub fn max_array_dims(mut self, dims: usize) -> Self {
        self.max_array_dims = dims;
        self
    }

    /// Sets the table nesting limit.
    pub fn max_table_depth(mut self, depth: usize) -> Self {
        self.max_table_depth = depth;
        self
    }

    /// Sets the cursor prefetch size.
    pub fn fetch_size(mut self, rows: usize) -> Self {
        self.fetch_size = rows;
        self
    }

    /// Sets the per-invocation timeout.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the chunk name.
    pub fn chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }

    /// Validates the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_alloc_size == 0 {
            return Err(crate::Error::invalid_argument("max_alloc_size must be > 0"));
        }

        if self.max_array_dims == 0 || self.max_array_dims > MAX_ARRAY_DIMS {
            return Err(crate::Error::invalid_argument(format!(
                "max_array_dims must be between 1 and {}",
                MAX_ARRAY_DIMS
            )));
        }

        if self.max_table_depth < self.max_array_dims {
            return Err(crate::Error::invalid_argument(
                "max_table_depth must be >= max_array_dims",
            ));
        }

        if self.fetch_size == 0 {
            return Err(crate::Error::invalid_argument("fetch_size must be > 0"));
        }

        if self.chunk_name.is_empty() {
            return Err(crate::Error::invalid_argument("chunk_name must not be empty"));
        }

        Ok(())
    }
}
