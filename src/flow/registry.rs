use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::FlowRegistry;

#[derive(Debug, Clone)]
pub struct FiredCard {
    pub card_id: String,
    pub tokens: serde_json::Value,
    pub state: serde_json::Value,
}

/// In-process `FlowRegistry`: records every fired card for the status
/// surface and tests instead of dispatching to a real Flow engine.
pub struct InProcessFlowRegistry {
    fired: Mutex<Vec<FiredCard>>,
}

impl InProcessFlowRegistry {
    pub fn new() -> Self {
        Self {
            fired: Mutex::new(Vec::new()),
        }
    }

    pub fn fired_cards(&self) -> Vec<FiredCard> {
        self.fired.lock().clone()
    }

    pub fn last_fired(&self, card_id: &str) -> Option<FiredCard> {
        self.fired.lock().iter().rev().find(|c| c.card_id == card_id).cloned()
    }
}

impl Default for InProcessFlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowRegistry for InProcessFlowRegistry {
    async fn trigger(
        &self,
        card_id: &str,
        tokens: serde_json::Value,
        state: serde_json::Value,
    ) -> anyhow::Result<()> {
        debug!(card_id, %tokens, %state, "flow card fired");
        self.fired.lock().push(FiredCard {
            card_id: card_id.to_string(),
            tokens,
            state,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_fired_cards_in_order() {
        let registry = InProcessFlowRegistry::new();
        registry.trigger("price_level_changed", json!({}), json!({"priceLevel": "cheap"})).await.unwrap();
        registry.trigger("price_level_changed", json!({}), json!({"priceLevel": "expensive"})).await.unwrap();
        let last = registry.last_fired("price_level_changed").unwrap();
        assert_eq!(last.state["priceLevel"], "expensive");
        assert_eq!(registry.fired_cards().len(), 2);
    }
}
