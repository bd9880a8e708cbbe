//! Token usage tracking for LLM steps.
//!
//! Usage arrives on the `finish-step` part of a provider stream and is
//! accumulated per step and per run.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token usage statistics from one or more LLM operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    #[serde(default)]
    pub prompt_tokens: u32,

    /// Tokens produced by the completion.
    #[serde(default)]
    pub completion_tokens: u32,

    /// Total tokens (prompt + completion).
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    /// Create a usage record from prompt and completion counts.
    #[must_use]
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// A zeroed usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }
    }

    /// Whether no tokens have been recorded.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.total_tokens == 0
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates() {
        let mut total = Usage::zero();
        total += Usage::new(100, 50);
        total += Usage::new(10, 5);
        assert_eq!(total.prompt_tokens, 110);
        assert_eq!(total.completion_tokens, 55);
        assert_eq!(total.total_tokens, 165);
        assert!(!total.is_zero());
    }
}
