//! 本地信息智能体：药店、医院、餐厅等周边查询
//!
//! 依赖 location 实体；用户从其他智能体切换过来时，location 已由交接协议带入。

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::extraction::absorb;
use crate::agents::{DomainHandler, EntityExtractor, HandlerError, HandlerKind, HandlerResponse};
use crate::context::FusedContext;
use crate::core::state::{AgentContext, ConversationStage};

struct Place {
    kind: &'static str,
    location: &'static str,
    name: &'static str,
    detail: &'static str,
}

const PLACES: &[Place] = &[
    Place { kind: "pharmacy", location: "Girne", name: "Harbour Pharmacy", detail: "Ziya Rızkı Cd., open until 22:00" },
    Place { kind: "pharmacy", location: "Girne", name: "Kordon Eczanesi", detail: "on the seafront road, duty pharmacy on Sundays" },
    Place { kind: "pharmacy", location: "Lefkoşa", name: "Dereboyu Pharmacy", detail: "Dereboyu Cd., open 24 hours" },
    Place { kind: "hospital", location: "Girne", name: "Dr. Akçiçek State Hospital", detail: "emergency department open 24 hours" },
    Place { kind: "supermarket", location: "Girne", name: "Ada Supermarket", detail: "near the old harbour" },
    Place { kind: "restaurant", location: "Girne", name: "Niazi's", detail: "traditional kebab house on the coast road" },
    Place { kind: "restaurant", location: "Lapta", name: "Hilltop Meze", detail: "village meze with sea view" },
    Place { kind: "beach", location: "Alsancak", name: "Escape Beach", detail: "sandy beach with lifeguards in summer" },
    Place { kind: "atm", location: "Girne", name: "İş Bankası ATM", detail: "main street, next to the post office" },
];

pub struct LocalInfoHandler {
    extractor: Arc<dyn EntityExtractor>,
}

impl LocalInfoHandler {
    pub fn new(extractor: Arc<dyn EntityExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl DomainHandler for LocalInfoHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::LocalInfo
    }

    async fn handle(
        &self,
        user_input: &str,
        _context: &FusedContext,
        agent_context: &AgentContext,
    ) -> Result<HandlerResponse, HandlerError> {
        let info = absorb(self.extractor.as_ref(), user_input, &agent_context.collected_info);
        let location = info.get("location").and_then(|v| v.as_str()).map(str::to_string);
        let place_type = info.get("place_type").and_then(|v| v.as_str()).map(str::to_string);

        let (reply, stage, found) = match (location.as_deref(), place_type.as_deref()) {
            (None, _) => (
                "Which town are you in? I can look up pharmacies, hospitals, restaurants and more.".to_string(),
                ConversationStage::Discovery,
                0,
            ),
            (Some(loc), None) => (
                format!("What are you looking for around {loc}? For example a pharmacy, an ATM or a beach."),
                ConversationStage::Discovery,
                0,
            ),
            (Some(loc), Some(kind)) => {
                let hits: Vec<&Place> = PLACES
                    .iter()
                    .filter(|p| p.kind == kind && p.location == loc)
                    .collect();
                match hits.first() {
                    Some(first) => (
                        format!("The nearest {kind} in {loc} is {} ({}).", first.name, first.detail),
                        ConversationStage::Presenting,
                        hits.len(),
                    ),
                    None => (
                        format!("I don't have a {kind} listed in {loc} yet. Want me to check a nearby town?"),
                        ConversationStage::Refinement,
                        0,
                    ),
                }
            }
        };

        Ok(HandlerResponse {
            reply,
            collected_info: info,
            conversation_stage: stage,
            result_count: found,
            has_more_results: found > 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::PatternExtractor;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_uses_carried_location() {
        let handler = LocalInfoHandler::new(Arc::new(PatternExtractor::new()));
        let mut ctx = AgentContext::new(Utc::now());
        ctx.collected_info.insert("location".into(), json!("Girne"));

        let resp = handler
            .handle("where's the nearest pharmacy?", &FusedContext::default(), &ctx)
            .await
            .unwrap();
        assert!(resp.reply.contains("Girne"));
        assert_eq!(resp.conversation_stage, ConversationStage::Presenting);
        assert_eq!(resp.result_count, 2);
        assert!(resp.has_more_results);
    }

    #[tokio::test]
    async fn test_asks_for_location_when_unknown() {
        let handler = LocalInfoHandler::new(Arc::new(PatternExtractor::new()));
        let resp = handler
            .handle("nearest pharmacy?", &FusedContext::default(), &AgentContext::new(Utc::now()))
            .await
            .unwrap();
        assert_eq!(resp.conversation_stage, ConversationStage::Discovery);
        assert_eq!(resp.collected_info.get("place_type"), Some(&json!("pharmacy")));
    }
}
