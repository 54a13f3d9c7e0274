use serde::Serialize;

/// Lifecycle of one load cycle: `Idle -> Loading -> {Success | Partial | Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Idle,
    Loading,
    Success,
    Partial,
    Error,
}

impl LoadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadStatus::Success | LoadStatus::Partial | LoadStatus::Error)
    }

    /// `Success` if nothing failed, `Error` if nothing succeeded, else `Partial`.
    ///
    /// A cycle with no sources at all is a success.
    pub fn from_outcomes(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => LoadStatus::Success,
            (0, _) => LoadStatus::Error,
            _ => LoadStatus::Partial,
        }
    }
}

/// Why one source contributed no articles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub url: String,
    pub reason: String,
}

/// Snapshot published to observers after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedLoadingState {
    pub status: LoadStatus,
    /// 0 to 100, non-decreasing within a cycle.
    pub progress: u8,
    /// e.g. "Fetching 3 of 12".
    pub current_action: String,
    /// True once the current cycle has reached a terminal status.
    pub is_resolved: bool,
    pub errors: Vec<SourceFailure>,
}

impl Default for FeedLoadingState {
    fn default() -> Self {
        Self {
            status: LoadStatus::Idle,
            progress: 0,
            current_action: String::new(),
            is_resolved: false,
            errors: Vec::new(),
        }
    }
}

/// Whole-number percentage of `done` over `total`. An empty cycle is complete.
pub(crate) fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = done.min(total) * 100 / total;
    u8::try_from(pct).unwrap_or(100)
}
