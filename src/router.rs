//! Intent routing
//!
//! Classifies a message into an intent and picks the model that should serve
//! it. Rules are evaluated in priority order and the first match wins:
//! imperative verb (ACTION), reasoning phrase (REASON, only when a reasoning
//! model exists), question with a document corpus (QUERY), greeting or very
//! short message (CHAT), then CHAT on the current model.
//!
//! Routing never fails; weak matches come back with low confidence instead.

use crate::catalog::Catalog;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

const ACTION_VERBS: &[&str] = &[
    "turn", "set", "open", "toggle", "create", "send", "tap", "scroll", "click", "swipe", "press",
    "enable", "disable", "launch", "close", "start", "stop", "switch", "navigate", "call", "dial",
    "text", "compose", "share", "search", "find", "show", "hide", "move", "adjust", "increase",
    "decrease", "mute", "unmute",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(&format!("(?i){p}")) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!(pattern = %p, error = %e, "Invalid routing pattern");
                None
            }
        })
        .collect()
}

static QUERY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"^what\s+(is|are|was|were)\b",
        r"^who\s+(is|are|was|were)\b",
        r"^where\s+(is|are|was|were)\b",
        r"^when\s+(is|are|was|were|did)\b",
        r"^how\s+(does|do|did|is|are|to)\b",
        r"^explain\b",
        r"^tell\s+me\s+about\b",
        r"^describe\b",
        r"^define\b",
        r"^summarize\b",
    ])
});

static REASON_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bplan\b",
        r"\bstep\s+by\s+step\b",
        r"\banalyze\b",
        r"\bcompare\b",
        r"\bevaluate\b",
        r"\bthink\s+(about|through)\b",
        r"\breason\b",
        r"\bbreak\s+(it\s+)?down\b",
        r"\bpros\s+and\s+cons\b",
    ])
});

static CHAT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"^(hi|hello|hey|howdy|yo|sup|greetings)\b",
        r"^(good\s+(morning|afternoon|evening|night))\b",
        r"^(thanks|thank\s+you|thx)\b",
        r"^(bye|goodbye|see\s+you|later)\b",
        r"^(ok|okay|sure|yes|no|yeah|nah)\b$",
    ])
});

/// Messages with at most this many whitespace-separated tokens default to chat
const SHORT_MESSAGE_TOKENS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Intent {
    Action,
    Query,
    Reason,
    Chat,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Action => write!(f, "ACTION"),
            Self::Query => write!(f, "QUERY"),
            Self::Reason => write!(f, "REASON"),
            Self::Chat => write!(f, "CHAT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingResult {
    pub intent: Intent,
    pub target_model_slug: String,
    pub confidence: f32,
    pub reason: String,
}

impl RoutingResult {
    fn new(intent: Intent, target: &str, confidence: f32, reason: impl Into<String>) -> Self {
        Self {
            intent,
            target_model_slug: target.to_string(),
            confidence,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingContext {
    pub current_model_slug: String,
    pub has_document_corpus: bool,
}

/// Target model overrides; unset fields are derived from the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub action_model: String,
    pub query_model: String,
    pub chat_model: Option<String>,
    pub reasoning_model: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            action_model: "lfm2-1.2b".to_string(),
            query_model: "lfm2-1.2b".to_string(),
            chat_model: None,
            reasoning_model: None,
        }
    }
}

/// Stateless message classifier
#[derive(Debug, Clone)]
pub struct IntentRouter {
    action_model: String,
    query_model: String,
    chat_model: String,
    /// `None` disables the REASON rule
    reasoning_model: Option<String>,
}

impl IntentRouter {
    pub fn new(catalog: &Catalog, config: RouterConfig) -> Self {
        let chat_model = config
            .chat_model
            .or_else(|| catalog.smallest_chat_model().map(|e| e.slug.clone()))
            .unwrap_or_else(|| "lfm2-350m".to_string());

        let reasoning_model = match config.reasoning_model {
            Some(slug) if catalog.contains(&slug) => Some(slug),
            Some(slug) => {
                tracing::warn!(slug = %slug, "Configured reasoning model not in catalog, reasoning route disabled");
                None
            }
            None => catalog.reasoning_model().map(|e| e.slug.clone()),
        };

        Self {
            action_model: config.action_model,
            query_model: config.query_model,
            chat_model,
            reasoning_model,
        }
    }

    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }

    pub fn reasoning_model(&self) -> Option<&str> {
        self.reasoning_model.as_deref()
    }

    pub fn route(&self, message: &str, context: &RoutingContext) -> RoutingResult {
        let trimmed = message.trim();
        let first_word = trimmed
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase();

        if ACTION_VERBS.contains(&first_word.as_str()) {
            return RoutingResult::new(
                Intent::Action,
                &self.action_model,
                0.9,
                format!("Imperative verb \"{first_word}\" detected"),
            );
        }

        if let Some(reasoning_model) = &self.reasoning_model
            && let Some(pattern) = REASON_PATTERNS.iter().find(|p| p.is_match(trimmed))
        {
            return RoutingResult::new(
                Intent::Reason,
                reasoning_model,
                0.8,
                format!("Reasoning pattern /{}/ matched", pattern.as_str()),
            );
        }

        if context.has_document_corpus
            && let Some(pattern) = QUERY_PATTERNS.iter().find(|p| p.is_match(trimmed))
        {
            return RoutingResult::new(
                Intent::Query,
                &self.query_model,
                0.85,
                format!("Query pattern /{}/ matched", pattern.as_str()),
            );
        }

        if CHAT_PATTERNS.iter().any(|p| p.is_match(trimmed)) {
            return RoutingResult::new(
                Intent::Chat,
                &self.chat_model,
                0.9,
                "Chat/greeting pattern matched",
            );
        }

        if trimmed.split_whitespace().count() <= SHORT_MESSAGE_TOKENS {
            return RoutingResult::new(
                Intent::Chat,
                &self.chat_model,
                0.6,
                "Short message defaulted to chat",
            );
        }

        RoutingResult::new(
            Intent::Chat,
            &context.current_model_slug,
            0.5,
            "No strong pattern match, using current model",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::builtin_models;

    fn router() -> IntentRouter {
        IntentRouter::new(&Catalog::default(), RouterConfig::default())
    }

    fn ctx(current: &str, corpus: bool) -> RoutingContext {
        RoutingContext {
            current_model_slug: current.to_string(),
            has_document_corpus: corpus,
        }
    }

    #[test]
    fn test_action_verb() {
        let result = router().route("Turn on the flashlight", &ctx("lfm2-350m", false));
        assert_eq!(result.intent, Intent::Action);
        assert_eq!(result.target_model_slug, "lfm2-1.2b");
        assert_eq!(result.confidence, 0.9);
        assert!(result.reason.contains("turn"));
    }

    #[test]
    fn test_action_beats_reasoning() {
        let result = router().route("Open the plan document", &ctx("lfm2-350m", true));
        assert_eq!(result.intent, Intent::Action);
    }

    #[test]
    fn test_greeting_goes_to_smallest_model() {
        let result = router().route("Hi", &ctx("lfm2-1.2b", false));
        assert_eq!(result.intent, Intent::Chat);
        assert_eq!(result.target_model_slug, "lfm2-350m");
        assert_eq!(result.confidence, 0.9);
    }

    #[test]
    fn test_query_requires_corpus() {
        let router = router();
        let message = "What is quantum computing and why does it matter?";

        let without = router.route(message, &ctx("lfm2-700m", false));
        assert_ne!(without.intent, Intent::Query);

        let with = router.route(message, &ctx("lfm2-700m", true));
        assert_eq!(with.intent, Intent::Query);
        assert_eq!(with.confidence, 0.85);
        assert_eq!(with.target_model_slug, "lfm2-1.2b");
    }

    #[test]
    fn test_reasoning_pattern() {
        let result = router().route(
            "Can you compare these two phones for me please",
            &ctx("lfm2-350m", false),
        );
        assert_eq!(result.intent, Intent::Reason);
        assert_eq!(result.target_model_slug, "lfm25-1.2b-thinking");
        assert_eq!(result.confidence, 0.8);
    }

    #[test]
    fn test_reasoning_disabled_without_thinking_model() {
        let catalog = Catalog::new(
            builtin_models()
                .into_iter()
                .filter(|e| !e.capabilities.thinking)
                .collect(),
        );
        let router = IntentRouter::new(&catalog, RouterConfig::default());
        assert!(router.reasoning_model().is_none());

        let result = router.route(
            "Can you think through the pros and cons of moving",
            &ctx("lfm2-700m", false),
        );
        assert_eq!(result.intent, Intent::Chat);
        assert_eq!(result.target_model_slug, "lfm2-700m");
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_short_message_default() {
        let result = router().route("weather in Paris", &ctx("lfm2-1.2b", false));
        assert_eq!(result.intent, Intent::Chat);
        assert_eq!(result.confidence, 0.6);
        assert_eq!(result.target_model_slug, "lfm2-350m");
    }

    #[test]
    fn test_default_keeps_current_model() {
        let result = router().route(
            "I had a really interesting day at the museum today",
            &ctx("lfm2-700m", false),
        );
        assert_eq!(result.intent, Intent::Chat);
        assert_eq!(result.target_model_slug, "lfm2-700m");
        assert_eq!(result.confidence, 0.5);
        assert!(!result.reason.is_empty());
    }

    #[test]
    fn test_affirmation_must_be_whole_message() {
        let router = router();
        assert_eq!(router.route("okay", &ctx("m", false)).confidence, 0.9);
        // "no" followed by more words is not the bare-affirmation pattern
        let result = router.route("no way that happened last night", &ctx("m", false));
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_empty_message() {
        let result = router().route("   ", &ctx("lfm2-700m", false));
        assert_eq!(result.intent, Intent::Chat);
        assert_eq!(result.confidence, 0.6);
    }

    #[test]
    fn test_config_overrides() {
        let config = RouterConfig {
            action_model: "lfm25-mobile-actions".to_string(),
            chat_model: Some("lfm2-700m".to_string()),
            ..Default::default()
        };
        let router = IntentRouter::new(&Catalog::default(), config);
        assert_eq!(
            router.route("set an alarm", &ctx("m", false)).target_model_slug,
            "lfm25-mobile-actions"
        );
        assert_eq!(router.route("hello", &ctx("m", false)).target_model_slug, "lfm2-700m");
    }

    #[test]
    fn test_intent_serialization() {
        assert_eq!(serde_json::to_string(&Intent::Action).unwrap(), "\"ACTION\"");
        assert_eq!(Intent::Reason.to_string(), "REASON");
    }
}
