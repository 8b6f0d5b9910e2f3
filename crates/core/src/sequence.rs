//! Injected sequence generation for human-readable document numbers.
//!
//! Order and payment numbers come from a `SequenceGenerator` handed in by the
//! caller; uniqueness is enforced by whatever backs the generator (a database
//! sequence in production), and tests supply deterministic values.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{DomainResult, require_non_blank};

/// Source of monotonically increasing sequence values.
pub trait SequenceGenerator: Send + Sync {
    fn next_value(&self) -> u64;
}

impl<S> SequenceGenerator for Arc<S>
where
    S: SequenceGenerator + ?Sized,
{
    fn next_value(&self) -> u64 {
        (**self).next_value()
    }
}

/// Process-local counter for tests/dev.
#[derive(Debug)]
pub struct InMemorySequence {
    next: AtomicU64,
}

impl InMemorySequence {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for InMemorySequence {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceGenerator for InMemorySequence {
    fn next_value(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Human-readable document number, e.g. `ORD-00000042`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentNumber(String);

impl DocumentNumber {
    pub fn new(prefix: &str, value: u64) -> Self {
        Self(format!("{prefix}-{value:08}"))
    }

    /// Accept an externally issued number verbatim.
    pub fn parse(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        require_non_blank(&raw, "document number")?;
        Ok(Self(raw))
    }

    pub fn next(generator: &dyn SequenceGenerator, prefix: &str) -> Self {
        Self::new(prefix, generator.next_value())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DocumentNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
