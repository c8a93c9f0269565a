//! 房产智能体：按地点 / 卧室数 / 预算筛选租赁房源
//!
//! 房源数据来自内置小样本目录；真实部署中这里调用房源搜索服务。

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::extraction::absorb;
use crate::agents::{DomainHandler, EntityExtractor, HandlerError, HandlerKind, HandlerResponse};
use crate::context::FusedContext;
use crate::core::state::{display_value, AgentContext, ConversationStage, EntityMap};

struct Listing {
    title: &'static str,
    location: &'static str,
    bedrooms: u64,
    monthly_rent: u64,
}

const LISTINGS: &[Listing] = &[
    Listing { title: "Harbour view flat", location: "Girne", bedrooms: 2, monthly_rent: 650 },
    Listing { title: "Garden apartment near Ramadan Cemil square", location: "Girne", bedrooms: 2, monthly_rent: 550 },
    Listing { title: "Penthouse with roof terrace", location: "Girne", bedrooms: 3, monthly_rent: 1100 },
    Listing { title: "Studio by the old town", location: "Girne", bedrooms: 1, monthly_rent: 400 },
    Listing { title: "Family house with pool", location: "Alsancak", bedrooms: 3, monthly_rent: 950 },
    Listing { title: "Modern flat close to university", location: "Lefkoşa", bedrooms: 2, monthly_rent: 480 },
    Listing { title: "Seafront apartment", location: "İskele", bedrooms: 2, monthly_rent: 600 },
    Listing { title: "Bungalow in the hills", location: "Lapta", bedrooms: 2, monthly_rent: 700 },
];

/// 每次最多展示的房源数
const PAGE_SIZE: usize = 3;

const REFINE_WORDS: &[&str] = &["cheaper", "bigger", "smaller", "another", "other", "more options", "closer"];
const TRANSACTION_WORDS: &[&str] = &["book", "reserve", "viewing", "contact the landlord", "sign"];

pub struct PropertyHandler {
    extractor: Arc<dyn EntityExtractor>,
}

impl PropertyHandler {
    pub fn new(extractor: Arc<dyn EntityExtractor>) -> Self {
        Self { extractor }
    }

    fn search(info: &EntityMap) -> Vec<&'static Listing> {
        let location = info.get("location").and_then(|v| v.as_str());
        let bedrooms = info.get("bedrooms").and_then(|v| v.as_u64());
        let budget = info.get("budget").and_then(|v| v.as_u64());
        LISTINGS
            .iter()
            .filter(|l| location.map_or(true, |loc| l.location == loc))
            .filter(|l| bedrooms.map_or(true, |b| l.bedrooms == b))
            .filter(|l| budget.map_or(true, |b| l.monthly_rent <= b))
            .collect()
    }

    fn next_stage(previous: ConversationStage, input: &str, info: &EntityMap) -> ConversationStage {
        let lower = input.to_lowercase();
        let complete = ["location", "bedrooms", "budget"].iter().all(|k| info.contains_key(*k));
        let shown = matches!(
            previous,
            ConversationStage::Presenting | ConversationStage::Refinement | ConversationStage::Transaction
        );
        if shown && TRANSACTION_WORDS.iter().any(|w| lower.contains(w)) {
            ConversationStage::Transaction
        } else if shown && REFINE_WORDS.iter().any(|w| lower.contains(w)) {
            ConversationStage::Refinement
        } else if complete {
            ConversationStage::Presenting
        } else if info.is_empty() {
            ConversationStage::Greeting
        } else {
            ConversationStage::Discovery
        }
    }
}

#[async_trait]
impl DomainHandler for PropertyHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Property
    }

    async fn handle(
        &self,
        user_input: &str,
        _context: &FusedContext,
        agent_context: &AgentContext,
    ) -> Result<HandlerResponse, HandlerError> {
        let info = absorb(self.extractor.as_ref(), user_input, &agent_context.collected_info);
        let stage = Self::next_stage(agent_context.conversation_stage, user_input, &info);
        let matches = Self::search(&info);

        let reply = match stage {
            ConversationStage::Greeting => {
                "Happy to help you find a place. Which area, how many bedrooms and what monthly budget?".to_string()
            }
            ConversationStage::Discovery => {
                let known: Vec<String> = info
                    .iter()
                    .map(|(k, v)| format!("{} {}", k, display_value(v)))
                    .collect();
                let missing: Vec<&str> = ["location", "bedrooms", "budget"]
                    .into_iter()
                    .filter(|k| !info.contains_key(*k))
                    .collect();
                format!(
                    "Noted: {}. Could you also tell me your {}?",
                    known.join(", "),
                    missing.join(" and ")
                )
            }
            ConversationStage::Transaction => match matches.first() {
                Some(listing) => format!(
                    "I'll request a viewing for \"{}\" in {}. The agent will confirm a time shortly.",
                    listing.title, listing.location
                ),
                None => "There is nothing to book yet; shall we widen the search?".to_string(),
            },
            ConversationStage::Presenting | ConversationStage::Refinement => {
                if matches.is_empty() {
                    "No listings match those filters right now. Try a higher budget or a nearby area.".to_string()
                } else {
                    let lines: Vec<String> = matches
                        .iter()
                        .take(PAGE_SIZE)
                        .map(|l| format!("- {} ({}, {} bed, £{}/month)", l.title, l.location, l.bedrooms, l.monthly_rent))
                        .collect();
                    format!("I found {} listing(s):\n{}", matches.len(), lines.join("\n"))
                }
            }
        };

        Ok(HandlerResponse {
            reply,
            collected_info: info,
            conversation_stage: stage,
            result_count: matches.len(),
            has_more_results: matches.len() > PAGE_SIZE,
        })
    }
}
