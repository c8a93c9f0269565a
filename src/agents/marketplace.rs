//! 二手市场智能体：按品类浏览在售物品

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::extraction::absorb;
use crate::agents::{DomainHandler, EntityExtractor, HandlerError, HandlerKind, HandlerResponse};
use crate::context::FusedContext;
use crate::core::state::{AgentContext, ConversationStage};

struct Item {
    category: &'static str,
    title: &'static str,
    price: u64,
    location: &'static str,
}

const ITEMS: &[Item] = &[
    Item { category: "furniture", title: "Three-seat fabric sofa", price: 180, location: "Girne" },
    Item { category: "furniture", title: "Oak dining table with six chairs", price: 250, location: "Lefkoşa" },
    Item { category: "furniture", title: "Double wardrobe", price: 90, location: "Girne" },
    Item { category: "electronics", title: "55\" smart TV", price: 300, location: "Girne" },
    Item { category: "electronics", title: "Laptop, 16GB RAM", price: 420, location: "Gazimağusa" },
    Item { category: "vehicles", title: "125cc scooter", price: 900, location: "Girne" },
    Item { category: "clothing", title: "Winter jacket (M)", price: 25, location: "Lefkoşa" },
];

const PAGE_SIZE: usize = 3;

pub struct MarketplaceHandler {
    extractor: Arc<dyn EntityExtractor>,
}

impl MarketplaceHandler {
    pub fn new(extractor: Arc<dyn EntityExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl DomainHandler for MarketplaceHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Marketplace
    }

    async fn handle(
        &self,
        user_input: &str,
        _context: &FusedContext,
        agent_context: &AgentContext,
    ) -> Result<HandlerResponse, HandlerError> {
        let info = absorb(self.extractor.as_ref(), user_input, &agent_context.collected_info);
        let Some(category) = info.get("category").and_then(|v| v.as_str()) else {
            return Ok(HandlerResponse {
                reply: "What kind of item are you after? Furniture, electronics, vehicles or clothing?".to_string(),
                collected_info: info,
                conversation_stage: ConversationStage::Discovery,
                result_count: 0,
                has_more_results: false,
            });
        };

        let location = info.get("location").and_then(|v| v.as_str());
        let budget = info.get("budget").and_then(|v| v.as_u64());
        let hits: Vec<&Item> = ITEMS
            .iter()
            .filter(|i| i.category == category)
            .filter(|i| location.map_or(true, |loc| i.location == loc))
            .filter(|i| budget.map_or(true, |b| i.price <= b))
            .collect();

        let (reply, stage) = if hits.is_empty() {
            (
                format!("Nothing in {category} matches right now. I can drop the area or budget filter if you like."),
                ConversationStage::Refinement,
            )
        } else {
            let lines: Vec<String> = hits
                .iter()
                .take(PAGE_SIZE)
                .map(|i| format!("- {} for £{} ({})", i.title, i.price, i.location))
                .collect();
            (
                format!("Here is what's listed in {category}:\n{}", lines.join("\n")),
                ConversationStage::Presenting,
            )
        };

        let count = hits.len();
        Ok(HandlerResponse {
            reply,
            collected_info: info,
            conversation_stage: stage,
            result_count: count,
            has_more_results: count > PAGE_SIZE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::PatternExtractor;
    use chrono::Utc;

    #[tokio::test]
    async fn test_filters_by_category_and_location() {
        let handler = MarketplaceHandler::new(Arc::new(PatternExtractor::new()));
        let resp = handler
            .handle("any second hand sofa in Girne?", &FusedContext::default(), &AgentContext::new(Utc::now()))
            .await
            .unwrap();
        assert_eq!(resp.conversation_stage, ConversationStage::Presenting);
        assert_eq!(resp.result_count, 2);
    }
}
