pub mod registry;

use async_trait::async_trait;

/// Flow trigger-card identifiers this crate fires (§6).
pub mod cards {
    pub const OPERATING_MODE_CHANGED: &str = "operating_mode_changed";
    pub const PRICE_LEVEL_CHANGED: &str = "price_level_changed";
    pub const PLAN_UPDATED: &str = "plan_updated";
}

/// Dispatches Flow trigger cards. The shipped implementation
/// (`registry::InProcessFlowRegistry`) just records/broadcasts fired cards
/// in-process; a platform adapter would forward to the real Flow engine
/// behind the same trait (§6.1).
#[async_trait]
pub trait FlowRegistry: Send + Sync {
    async fn trigger(
        &self,
        card_id: &str,
        tokens: serde_json::Value,
        state: serde_json::Value,
    ) -> anyhow::Result<()>;
}
