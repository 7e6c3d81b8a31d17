use serde::{Deserialize, Serialize};

/// Item counts per store location, for dashboards and drain loops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub scheduled: usize,
    pub in_flight: usize,
}

impl StoreCounts {
    /// True once nothing is waiting or being worked on.
    pub fn is_drained(&self) -> bool {
        self.scheduled == 0 && self.in_flight == 0
    }
}
