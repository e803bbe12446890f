//! Gap limit management for HD wallet address discovery
//!
//! Implements BIP44 gap limit tracking to decide when a chain has been
//! scanned far enough during account recovery. Each chain (receive and
//! change) keeps its own counter of consecutive unused addresses.

use core::cmp;

use crate::address::ChainKind;

/// Gap limit used when a caller does not configure one
pub const DEFAULT_GAP_LIMIT: u32 = 10;

/// Maximum gap limit to prevent excessive address generation
pub const MAX_GAP_LIMIT: u32 = 1000;

/// Stages of gap limit processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapLimitStage {
    /// Still probing the chain for activity
    Scanning,
    /// A run of `limit` unused addresses has been observed
    Complete,
}

/// Gap limit tracker for a single chain (receive or change)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapLimit {
    /// The gap limit value
    pub limit: u32,
    /// Current stage of processing
    pub stage: GapLimitStage,
    /// Count of consecutive unused addresses
    pub current_unused_count: u32,
    /// Highest index that has been used
    pub highest_used_index: Option<u32>,
    /// Number of addresses classified as used
    pub used_count: u32,
    /// Number of addresses classified as unused
    pub unused_count: u32,
    /// Gap increments caused by failed batches rather than observed addresses
    pub degraded_increments: u32,
}

impl GapLimit {
    /// Create a new gap limit tracker. The limit is clamped to `1..=MAX_GAP_LIMIT`.
    pub fn new(limit: u32) -> Self {
        let safe_limit = cmp::min(cmp::max(limit, 1), MAX_GAP_LIMIT);
        Self {
            limit: safe_limit,
            stage: GapLimitStage::Scanning,
            current_unused_count: 0,
            highest_used_index: None,
            used_count: 0,
            unused_count: 0,
            degraded_increments: 0,
        }
    }

    /// Mark an address at the given index as used
    pub fn mark_used(&mut self, index: u32) {
        self.used_count += 1;
        self.highest_used_index = match self.highest_used_index {
            None => Some(index),
            Some(current) => Some(cmp::max(current, index)),
        };
        self.current_unused_count = 0;
        self.update_stage();
    }

    /// Mark an address as observed without any history
    pub fn mark_unused(&mut self) {
        self.unused_count += 1;
        self.current_unused_count += 1;
        self.update_stage();
    }

    /// Count a batch that could not be queried as one unused step.
    ///
    /// This keeps scanning finite when the provider keeps failing, at the
    /// risk of stopping before real activity further down the chain.
    pub fn record_failed_batch(&mut self) {
        self.degraded_increments += 1;
        self.current_unused_count += 1;
        self.update_stage();
    }

    fn update_stage(&mut self) {
        self.stage = if self.current_unused_count >= self.limit {
            GapLimitStage::Complete
        } else {
            GapLimitStage::Scanning
        };
    }

    /// Whether the chain still needs to be queried
    pub fn should_query(&self) -> bool {
        self.stage == GapLimitStage::Scanning
    }

    /// Whether a run of `limit` unused addresses has been observed
    pub fn limit_reached(&self) -> bool {
        self.stage == GapLimitStage::Complete
    }

    /// Get statistics about the gap limit
    pub fn stats(&self) -> GapLimitStats {
        GapLimitStats {
            limit: self.limit,
            stage: self.stage,
            current_gap: self.current_unused_count,
            highest_used: self.highest_used_index,
            used_count: self.used_count,
            unused_count: self.unused_count,
            degraded_increments: self.degraded_increments,
        }
    }
}

/// Statistics about gap limit state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapLimitStats {
    pub limit: u32,
    pub stage: GapLimitStage,
    pub current_gap: u32,
    pub highest_used: Option<u32>,
    pub used_count: u32,
    pub unused_count: u32,
    pub degraded_increments: u32,
}

/// Gap limits for both chains of an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapLimitManager {
    /// Receive (external) chain
    pub receive: GapLimit,
    /// Change (internal) chain
    pub change: GapLimit,
}

impl GapLimitManager {
    /// Create a manager applying the same limit to both chains
    pub fn new(limit: u32) -> Self {
        Self {
            receive: GapLimit::new(limit),
            change: GapLimit::new(limit),
        }
    }

    pub fn get(&self, chain: ChainKind) -> &GapLimit {
        match chain {
            ChainKind::Receive => &self.receive,
            ChainKind::Change => &self.change,
        }
    }

    pub fn get_mut(&mut self, chain: ChainKind) -> &mut GapLimit {
        match chain {
            ChainKind::Receive => &mut self.receive,
            ChainKind::Change => &mut self.change,
        }
    }

    /// Count a failed batch against every chain that is still scanning
    pub fn record_failed_batch(&mut self) {
        for chain in [ChainKind::Receive, ChainKind::Change] {
            let gap = self.get_mut(chain);
            if gap.should_query() {
                gap.record_failed_batch();
            }
        }
    }

    /// Check if discovery is complete
    pub fn is_discovery_complete(&self) -> bool {
        self.receive.limit_reached() && self.change.limit_reached()
    }

    /// Get combined statistics
    pub fn stats(&self) -> GapLimitManagerStats {
        GapLimitManagerStats {
            receive: self.receive.stats(),
            change: self.change.stats(),
            discovery_complete: self.is_discovery_complete(),
        }
    }
}

impl Default for GapLimitManager {
    fn default() -> Self {
        Self::new(DEFAULT_GAP_LIMIT)
    }
}

/// Combined statistics for both chains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapLimitManagerStats {
    pub receive: GapLimitStats,
    pub change: GapLimitStats,
    pub discovery_complete: bool,
}
