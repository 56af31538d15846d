use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource vector a stage claims while it runs.
///
/// Every dimension is compared independently: a requirement fits a budget
/// only when each component fits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub cpu_millis: u64,
}

impl ResourceRequirements {
    pub const ZERO: Self = Self {
        memory_mb: 0,
        cpu_millis: 0,
    };

    pub const fn new(memory_mb: u64, cpu_millis: u64) -> Self {
        Self {
            memory_mb,
            cpu_millis,
        }
    }

    pub const fn memory(memory_mb: u64) -> Self {
        Self::new(memory_mb, 0)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn fits_within(&self, budget: &Self) -> bool {
        self.memory_mb <= budget.memory_mb && self.cpu_millis <= budget.cpu_millis
    }

    #[must_use]
    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
        }
    }

    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self {
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
        }
    }
}

impl fmt::Display for ResourceRequirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MB/{}m", self.memory_mb, self.cpu_millis)
    }
}
