//! Keyword-based turn classifier.
//!
//! Good enough to drive pacing and persuasion without a model call.
//! Deployments with a real classifier implement [`TurnClassifier`] instead.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::TurnClassifier;
use crate::error::CollaboratorError;
use crate::types::{Archetype, ConversationProfile, LogicalTurn, Sentiment, TurnLabels, Urgency};

static POSITIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(obrigad[oa]|valeu|[óo]timo|perfeito|legal|top|amei|adorei|show|thanks|great|perfect)\b").unwrap()
});
static NEGATIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(ruim|p[ée]ssimo|caro|problema|reclama\w*|horr[íi]vel|demora\w*|bad|expensive|terrible)\b").unwrap()
});
static URGENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(urgente|agora|hoje|r[áa]pido|logo|asap|urgent|now|today)\b").unwrap());
static RELAXED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(sem\s+pressa|qualquer\s+dia|depois\s+vejo|no\s+rush|whenever)\b").unwrap());
static INTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(agendar|marcar|pre[çc]o|valor|quanto\s+custa|or[çc]amento|comprar|hor[áa]rio|dispon[íi]vel|vaga|price|book|schedule)\w*").unwrap()
});

static ARCHETYPES: Lazy<Vec<(Archetype, Regex)>> = Lazy::new(|| {
    vec![
        (
            Archetype::Skeptical,
            Regex::new(r"(?i)\b(ser[áa]|duvido|confi[áa]vel|garantia|golpe|avalia[çc][õo]es|really|guarantee|scam)\b").unwrap(),
        ),
        (
            Archetype::Analytical,
            Regex::new(r"(?i)(\d|\b(pre[çc]o|valor|quanto|compar\w*|detalhe\w*|tabela|desconto|price|compare|details)\b)").unwrap(),
        ),
        (
            Archetype::Emotional,
            Regex::new(r"(?i)(❤|😍|🥰|\b(amo|adoro|medo|preocup\w*|carinho|beb[êe]|filhote|love|worried)\b)").unwrap(),
        ),
        (
            Archetype::Pragmatic,
            Regex::new(r"(?i)\b(quando|onde|endere[çc]o|agendar|marcar|hor[áa]rio|when|where|address)\b").unwrap(),
        ),
    ]
});

/// Heuristic classifier over the turn text.
#[derive(Debug, Clone)]
pub struct LexicalClassifier {
    /// Weight of the previous engagement in the running average.
    pub engagement_memory: f32,
}

impl Default for LexicalClassifier {
    fn default() -> Self {
        Self {
            engagement_memory: 0.6,
        }
    }
}

impl LexicalClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(&self, text: &str, profile: &ConversationProfile) -> TurnLabels {
        let positives = POSITIVE.find_iter(text).count();
        let negatives = NEGATIVE.find_iter(text).count();
        let sentiment = match positives.cmp(&negatives) {
            std::cmp::Ordering::Greater => Sentiment::Positive,
            std::cmp::Ordering::Less => Sentiment::Negative,
            std::cmp::Ordering::Equal => Sentiment::Neutral,
        };

        let urgency = if URGENT.is_match(text) {
            Urgency::High
        } else if RELAXED.is_match(text) {
            Urgency::Low
        } else {
            Urgency::Normal
        };

        let archetype = ARCHETYPES
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(archetype, _)| *archetype)
            .or(profile.last_archetype)
            .unwrap_or_default();

        let engagement = self.engagement(text, profile);
        let follow_up_eligible = INTENT.is_match(text);

        TurnLabels {
            sentiment,
            urgency,
            engagement,
            archetype,
            follow_up_eligible,
        }
    }

    fn engagement(&self, text: &str, profile: &ConversationProfile) -> f32 {
        let words = text.split_whitespace().count();
        let mut signal: f32 = match words {
            0..=2 => 0.35,
            3..=7 => 0.6,
            _ => 0.8,
        };
        if text.contains('?') {
            signal += 0.1;
        }
        let signal = signal.clamp(0.0, 1.0);
        if profile.turns == 0 {
            return signal;
        }
        let memory = self.engagement_memory.clamp(0.0, 1.0);
        (memory * profile.engagement + (1.0 - memory) * signal).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl TurnClassifier for LexicalClassifier {
    async fn classify(
        &self,
        turn: &LogicalTurn,
        profile: &ConversationProfile,
    ) -> Result<TurnLabels, CollaboratorError> {
        Ok(self.label(&turn.text, profile))
    }
}
