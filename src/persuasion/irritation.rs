//! Irritation detection for replies to follow-ups.
//!
//! A small lexicon of Portuguese and English phrases. Patterns are
//! case-insensitive and tolerate missing accents ("nao" matches "não").

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IrritationCategory {
    /// Explicit request to stop messaging.
    Stop,
    /// Clear lack of interest.
    Rejection,
    /// Complaint about being pestered.
    Annoyance,
    Profanity,
}

/// The first lexicon entry a message matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IrritationSignal {
    pub category: IrritationCategory,
    pub phrase: String,
}

static LEXICON: Lazy<Vec<(IrritationCategory, Regex)>> = Lazy::new(|| {
    let entries: &[(IrritationCategory, &str)] = &[
        (
            IrritationCategory::Stop,
            r"(?i)\b(para|pare|parem|paren)\s+(de|com)\s+(me\s+)?(mandar|enviar|escrever|insistir|encher|ligar|mensage|isso)",
        ),
        (IrritationCategory::Stop, r"(?i)^\s*(chega|para|pare|stop)[\s!.]*$"),
        (
            IrritationCategory::Stop,
            r"(?i)\b(me\s+)?(tira|tire|remove|remova|exclui|exclua)\s+(da|dessa|desta)\s+lista\b",
        ),
        (IrritationCategory::Stop, r"(?i)\b(descadastr\w*|unsubscribe)\b"),
        (IrritationCategory::Stop, r"(?i)\bstop\s+(texting|messaging|sending)\b"),
        (
            IrritationCategory::Rejection,
            r"(?i)\bn[ãa]o\s+(quero|tenho\s+interesse|preciso|me\s+interessa)\b",
        ),
        (IrritationCategory::Rejection, r"(?i)\bsem\s+interesse\b"),
        (IrritationCategory::Rejection, r"(?i)\bnot\s+interested\b"),
        (IrritationCategory::Rejection, r"(?i)\bleave\s+me\s+alone\b"),
        (IrritationCategory::Rejection, r"(?i)\bme\s+deix[ae]\s+em\s+paz\b"),
        (
            IrritationCategory::Annoyance,
            r"(?i)\b(chat[oa]|insistente|inconveniente|irritante|spam|cansei|que\s+saco|saco\s+cheio)\b",
        ),
        (IrritationCategory::Annoyance, r"(?i)\bj[áa]\s+(disse|falei|respondi)\b"),
        (IrritationCategory::Annoyance, r"(?i)\b(annoying|spamming)\b"),
        (
            IrritationCategory::Profanity,
            r"(?i)\b(porra|caralho|merda|puta|fdp|vsf|vtnc|pqp|fuck\w*|shit)\b",
        ),
    ];
    entries
        .iter()
        .filter_map(|(category, pattern)| match Regex::new(pattern) {
            Ok(re) => Some((*category, re)),
            Err(e) => {
                log::error!("Invalid irritation pattern {:?}: {}", pattern, e);
                None
            }
        })
        .collect()
});

/// Inspect a user message for irritation.
pub fn detect(text: &str) -> Option<IrritationSignal> {
    LEXICON.iter().find_map(|(category, re)| {
        re.find(text).map(|m| IrritationSignal {
            category: *category,
            phrase: m.as_str().trim().to_string(),
        })
    })
}

pub fn is_irritated(text: &str) -> bool {
    detect(text).is_some()
}
