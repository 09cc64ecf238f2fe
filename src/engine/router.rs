// Intent/Task Router
// Classifies a request into an intent, ranked agents and a collaboration flag

//! # Intent Router
//!
//! Classification runs in three steps:
//!
//! 1. An [`IntentScorer`] scores every intent for the request.
//! 2. The best intent is chosen. Intents within `epsilon` of the best are
//!    tie-broken by the static priority of their top suggested agent.
//! 3. Agents are suggested from the intent's rule: primary capabilities at
//!    `score * 0.9`, fallback capabilities at `score * 0.6`.
//!
//! Routing never fails. A low score, a scorer error or an intent with no
//! registered agents all produce the fallback route: `GeneralInquiry` served
//! by the default agent, with `fallback = true`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::agents::AgentRegistry;
use crate::engine::coordinator::TIE_TOLERANCE;
use crate::models::{AgentCapability, AgentId, AgentSuggestion, IntentResult, IntentType, UserRequest};
use crate::{OrchestratorError, Result};

const PRIMARY_WEIGHT: f64 = 0.9;
const FALLBACK_WEIGHT: f64 = 0.6;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Top score below this takes the fallback route
    pub min_confidence: f64,
    /// Scores this close count as a tie
    pub epsilon: f64,
    /// Agents above this confidence count toward collaboration
    pub collaboration_threshold: f64,
    /// Agent serving the fallback route; defaults to the best support agent
    pub default_agent: Option<AgentId>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            epsilon: 0.05,
            collaboration_threshold: 0.6,
            default_agent: None,
        }
    }
}

/// Routing rule for one intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRule {
    pub intent_type: IntentType,
    pub keywords: Vec<String>,
    pub primary: Vec<AgentCapability>,
    #[serde(default)]
    pub fallback: Vec<AgentCapability>,
    /// Intent always needs more than one agent
    #[serde(default)]
    pub requires_collaboration: bool,
}

impl IntentRule {
    fn new(intent_type: IntentType, keywords: &[&str], primary: &[AgentCapability], fallback: &[AgentCapability]) -> Self {
        Self {
            intent_type,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            primary: primary.to_vec(),
            fallback: fallback.to_vec(),
            requires_collaboration: false,
        }
    }

    fn collaborative(mut self) -> Self {
        self.requires_collaboration = true;
        self
    }

    pub fn defaults() -> Vec<IntentRule> {
        use AgentCapability::*;

        vec![
            IntentRule::new(
                IntentType::SalesInquiry,
                &[
                    "price", "pricing", "quote", "buy", "purchase", "plan", "discount", "cost", "upgrade",
                    "subscription", "offer",
                ],
                &[Sales],
                &[Manager],
            ),
            IntentRule::new(
                IntentType::CustomerSupport,
                &[
                    "help", "problem", "account", "password", "login", "refund", "complaint", "billing",
                    "invoice", "cancel my",
                ],
                &[CustomerSupport],
                &[Sales],
            ),
            IntentRule::new(
                IntentType::TechnicalService,
                &[
                    "install", "installation", "repair", "outage", "broken", "router", "technician",
                    "signal", "network", "maintenance", "not working",
                ],
                &[FieldService],
                &[CustomerSupport],
            ),
            IntentRule::new(
                IntentType::ManagementDecision,
                &[
                    "approve", "approval", "exception", "escalate", "policy", "budget", "strategy",
                    "contract", "authorize",
                ],
                &[Manager],
                &[Sales],
            )
            .collaborative(),
            IntentRule::new(
                IntentType::CollaborationRequired,
                &["coordinate", "together", "multiple teams", "cross team", "end to end", "both teams"],
                &[Coordinator, Manager],
                &[Sales, CustomerSupport, FieldService],
            )
            .collaborative(),
            IntentRule::new(
                IntentType::GeneralInquiry,
                &["information", "question", "hours", "contact", "hello"],
                &[CustomerSupport],
                &[],
            ),
        ]
    }
}

/// Scores every intent for a request, higher is better, each in [0, 1]
#[async_trait]
pub trait IntentScorer: Send + Sync {
    async fn score(&self, request: &UserRequest) -> Result<Vec<(IntentType, f64)>>;
}

/// Keyword scorer: `1 - 0.5^hits` per intent
pub struct KeywordScorer {
    keywords: Vec<(IntentType, Vec<String>)>,
}

impl KeywordScorer {
    pub fn from_rules(rules: &[IntentRule]) -> Self {
        Self {
            keywords: rules
                .iter()
                .map(|r| (r.intent_type, r.keywords.iter().map(|k| normalize(k)).collect()))
                .collect(),
        }
    }

    fn hits(text: &str, keywords: &[String]) -> usize {
        keywords
            .iter()
            .filter(|k| !k.trim().is_empty() && text.contains(k.as_str()))
            .count()
    }
}

/// Lowercase, collapse non-alphanumerics to single spaces, pad with spaces
///
/// Padding makes `contains(" kw ")` a whole-word (or whole-phrase) match.
fn normalize(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}

#[async_trait]
impl IntentScorer for KeywordScorer {
    async fn score(&self, request: &UserRequest) -> Result<Vec<(IntentType, f64)>> {
        let text = normalize(&request.content);
        Ok(self
            .keywords
            .iter()
            .map(|(intent, keywords)| {
                let hits = Self::hits(&text, keywords);
                (*intent, 1.0 - 0.5f64.powi(hits as i32))
            })
            .collect())
    }
}

pub struct IntentRouter {
    config: RouterConfig,
    rules: Vec<IntentRule>,
    registry: Arc<AgentRegistry>,
    scorer: Arc<dyn IntentScorer>,
}

impl IntentRouter {
    pub fn new(registry: Arc<AgentRegistry>, config: RouterConfig) -> Self {
        let rules = IntentRule::defaults();
        let scorer = Arc::new(KeywordScorer::from_rules(&rules));
        Self {
            config,
            rules,
            registry,
            scorer,
        }
    }

    /// Replace the rules; the keyword scorer is rebuilt from them
    pub fn with_rules(mut self, rules: Vec<IntentRule>) -> Self {
        self.scorer = Arc::new(KeywordScorer::from_rules(&rules));
        self.rules = rules;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn IntentScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn rules(&self) -> &[IntentRule] {
        &self.rules
    }

    /// Classify a request; always returns a route
    pub async fn classify(&self, request: &UserRequest) -> IntentResult {
        let scores = match self.scorer.score(request).await {
            Ok(scores) => scores,
            Err(e) => {
                let e = OrchestratorError::IntentRouting(e.to_string());
                warn!(request_id = %request.request_id, "{}; using fallback route", e);
                return self.fallback_route(0.0, format!("scorer failed: {}", e));
            }
        };

        // Best first; equal scores keep rule order
        let mut ranked: Vec<(&IntentRule, f64)> = self
            .rules
            .iter()
            .filter_map(|rule| {
                scores
                    .iter()
                    .find(|(intent, _)| *intent == rule.intent_type)
                    .map(|(_, score)| (rule, score.clamp(0.0, 1.0)))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let Some(&(_, top_score)) = ranked.first() else {
            return self.fallback_route(0.0, "no intent scored".to_string());
        };
        if top_score < self.config.min_confidence {
            debug!(request_id = %request.request_id, top_score, "Low confidence, using fallback route");
            return self.fallback_route(
                top_score,
                format!("top score {:.2} below {:.2}", top_score, self.config.min_confidence),
            );
        }

        let candidates: Vec<(&IntentRule, f64, Vec<AgentSuggestion>)> = ranked
            .iter()
            .take_while(|(_, score)| top_score - score <= self.config.epsilon + TIE_TOLERANCE)
            .map(|(rule, score)| (*rule, *score, self.suggest(rule, *score)))
            .filter(|(_, _, suggestions)| !suggestions.is_empty())
            .collect();

        // Near-tie: highest priority of the top suggested agent wins, score order otherwise
        let mut chosen: Option<&(&IntentRule, f64, Vec<AgentSuggestion>)> = None;
        for candidate in &candidates {
            let priority = candidate.2[0].priority;
            if chosen.map_or(true, |c| priority > c.2[0].priority) {
                chosen = Some(candidate);
            }
        }

        let Some((rule, score, suggestions)) = chosen else {
            return self.fallback_route(top_score, "no registered agent serves the top intents".to_string());
        };

        let confident = suggestions
            .iter()
            .filter(|s| s.confidence > self.config.collaboration_threshold)
            .count();
        let requires_collaboration = confident > 1 || rule.requires_collaboration;

        let reasoning = if candidates.len() > 1 {
            format!(
                "{} intents within {:.2}; {} chosen by agent priority {}",
                candidates.len(),
                self.config.epsilon,
                rule.intent_type,
                suggestions[0].priority
            )
        } else {
            format!("{} scored {:.2}", rule.intent_type, score)
        };

        info!(
            request_id = %request.request_id,
            intent = %rule.intent_type,
            confidence = score,
            agents = suggestions.len(),
            requires_collaboration,
            "Request classified"
        );

        IntentResult {
            intent_type: rule.intent_type,
            confidence: *score,
            suggested_agents: suggestions.clone(),
            requires_collaboration,
            fallback: false,
            reasoning,
        }
    }

    /// Registered agents for a rule, best first
    fn suggest(&self, rule: &IntentRule, score: f64) -> Vec<AgentSuggestion> {
        let mut seen = HashSet::new();
        let mut suggestions = Vec::new();

        let tiers = [(&rule.primary, PRIMARY_WEIGHT), (&rule.fallback, FALLBACK_WEIGHT)];
        for (capabilities, weight) in tiers {
            for capability in capabilities.iter() {
                for agent in self.registry.by_capability(*capability) {
                    if seen.insert(agent.agent_id.clone()) {
                        suggestions.push(AgentSuggestion {
                            agent_id: agent.agent_id.clone(),
                            capability: agent.capability,
                            confidence: score * weight,
                            priority: agent.priority,
                        });
                    }
                }
            }
        }

        suggestions.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.priority.cmp(&a.priority))
        });
        suggestions
    }

    fn default_agent(&self) -> Option<AgentSuggestion> {
        let registration = self
            .config
            .default_agent
            .as_ref()
            .and_then(|id| self.registry.get(id))
            .or_else(|| self.registry.primary(AgentCapability::CustomerSupport))
            .or_else(|| self.registry.agents().first())?;

        Some(AgentSuggestion {
            agent_id: registration.agent_id.clone(),
            capability: registration.capability,
            confidence: self.config.min_confidence,
            priority: registration.priority,
        })
    }

    fn fallback_route(&self, confidence: f64, reasoning: String) -> IntentResult {
        IntentResult {
            intent_type: IntentType::GeneralInquiry,
            confidence,
            suggested_agents: self.default_agent().into_iter().collect(),
            requires_collaboration: false,
            fallback: true,
            reasoning,
        }
    }
}
