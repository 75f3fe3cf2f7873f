//! Contract between the orchestration core and the (external) view layer

use crate::record::Record;
use async_trait::async_trait;

/// What the core needs from a view.
///
/// The core never renders anything itself; it validates through the view,
/// tells it what to clear, and surfaces filter indicators. The default
/// methods accept everything, so headless embedders only override what
/// they care about.
#[async_trait]
pub trait FormView: Send + Sync {
    /// Flush pending UI-side edits into records. Must return false when
    /// the view holds invalid input; the core then short-circuits.
    async fn validate(&self) -> bool {
        true
    }

    /// Clear a block's display. `records` drops shown rows, `controls`
    /// resets field controls.
    fn clear(&self, _block: &str, _records: bool, _controls: bool) {}

    /// Show or hide the "results are filtered" indicator for a block.
    fn set_filter_indicator(&self, _block: &str, _active: bool) {}

    /// Whether the block has fields a user could type criteria into.
    fn has_queryable_fields(&self, _block: &str) -> bool {
        true
    }

    /// Distribute-on-edit notification for a changed record.
    fn record_changed(&self, _block: &str, _record: &Record) {}

    /// Leave query mode without executing.
    fn cancel(&self, _block: &str) {}
}

/// View that accepts and displays nothing. Used by tests and headless runs.
pub struct NullView;

#[async_trait]
impl FormView for NullView {}
