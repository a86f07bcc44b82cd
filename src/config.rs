//! Runtime configuration.
//!
//! Knobs for the process-wide resources the socket core owns. Values are
//! plain fields with builder-style setters so embedders can write
//! `RuntimeOptions::default().with_request_slots(256)`.

/// Configuration for a [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Upper bound on concurrently live request blocks.
    ///
    /// One block is held per in-flight connect/write/shutdown. When the
    /// arena is full, the launching operation fails with `ENOMEM` instead
    /// of allocating.
    /// - Default: 1024
    pub request_slots: usize,

    /// Upper bound on live pool blocks (read buffer backing storage).
    ///
    /// - `None`: unbounded (default)
    /// - `Some(n)`: allocations beyond `n` live blocks fail with `ENOMEM`
    pub pool_block_limit: Option<usize>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            request_slots: 1024,
            pool_block_limit: None,
        }
    }
}

impl RuntimeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_request_slots(mut self, slots: usize) -> Self {
        self.request_slots = slots;
        self
    }

    #[must_use]
    pub fn with_pool_block_limit(mut self, limit: Option<usize>) -> Self {
        self.pool_block_limit = limit;
        self
    }

}
