//! 闲聊智能体：问候、能力介绍，并在有长期记忆召回时提及之前的话题

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::extraction::absorb;
use crate::agents::{DomainHandler, EntityExtractor, HandlerError, HandlerKind, HandlerResponse};
use crate::context::{BlockKind, FusedContext};
use crate::core::state::{AgentContext, ConversationStage};

pub struct GeneralHandler {
    extractor: Arc<dyn EntityExtractor>,
}

impl GeneralHandler {
    pub fn new(extractor: Arc<dyn EntityExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl DomainHandler for GeneralHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::General
    }

    async fn handle(
        &self,
        user_input: &str,
        context: &FusedContext,
        agent_context: &AgentContext,
    ) -> Result<HandlerResponse, HandlerError> {
        let info = absorb(self.extractor.as_ref(), user_input, &agent_context.collected_info);

        let mut reply = String::from(
            "I can help you rent a home, browse second-hand items, or find places nearby like pharmacies and restaurants.",
        );
        if let Some(recall) = context.blocks_of(BlockKind::Recall).next() {
            reply.push_str(&format!(" Last time we talked about: {}", recall.content));
        }

        Ok(HandlerResponse {
            reply,
            collected_info: info,
            conversation_stage: ConversationStage::Greeting,
            result_count: 0,
            has_more_results: false,
        })
    }
}
