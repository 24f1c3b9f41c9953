//! Escalation tiers and the follow-up template book.
//!
//! The book maps `(archetype, tier)` to message variants. Unknown archetypes
//! and empty cells fall back to the default set; variants are picked with
//! the caller's RNG. Operators can replace the built-in wording with a YAML
//! document of the same shape.

use std::collections::HashMap;
use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::PersuasionConfig;
use crate::error::ConfigError;
use crate::types::Archetype;

/// Persuasion intensity of one follow-up level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTier {
    Low,
    Medium,
    High,
    Extreme,
}

impl fmt::Display for EscalationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EscalationTier::Low => "low",
            EscalationTier::Medium => "medium",
            EscalationTier::High => "high",
            EscalationTier::Extreme => "extreme",
        };
        f.write_str(name)
    }
}

impl EscalationTier {
    const ALL: [EscalationTier; 4] = [
        EscalationTier::Low,
        EscalationTier::Medium,
        EscalationTier::High,
        EscalationTier::Extreme,
    ];

    /// Nominal tier of `level` (1-based) in a sequence of `levels` levels.
    ///
    /// With seven levels: L1–L2 low, L3–L4 medium, L5–L6 high, L7 extreme.
    pub fn for_level(level: u8, levels: u8) -> Self {
        if levels == 0 || level >= levels {
            return EscalationTier::Extreme;
        }
        let index = (level.saturating_sub(1) as usize * 3) / (levels as usize - 1);
        match index {
            0 => EscalationTier::Low,
            1 => EscalationTier::Medium,
            _ => EscalationTier::High,
        }
    }

    /// Highest tier a sequence may reach, chosen once at arm time.
    ///
    /// Engaged conversations are capped lower; only low-engagement
    /// conversations may reach the extreme tier.
    pub fn cap_for_engagement(engagement: f32, config: &PersuasionConfig) -> Self {
        let engagement = if engagement.is_nan() {
            0.5
        } else {
            engagement.clamp(0.0, 1.0)
        };
        if engagement >= config.high_engagement {
            EscalationTier::Medium
        } else if engagement >= config.mid_engagement {
            EscalationTier::High
        } else {
            EscalationTier::Extreme
        }
    }
}

type TierTable = HashMap<EscalationTier, Vec<String>>;

/// Follow-up and apology wording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateBook {
    #[serde(default)]
    pub default: TierTable,
    #[serde(default)]
    pub archetypes: HashMap<Archetype, TierTable>,
    #[serde(default)]
    pub apologies: Vec<String>,
}

const LAST_RESORT_FOLLOW_UP: &str = "Oi! Ainda posso te ajudar com alguma coisa?";
const LAST_RESORT_APOLOGY: &str = "Desculpa o incômodo! Não vou mais te enviar mensagens. Se precisar, é só chamar.";

impl Default for TemplateBook {
    fn default() -> Self {
        let mut default = TierTable::new();
        default.insert(
            EscalationTier::Low,
            strings(&[
                "Oi! Conseguiu ver minha última mensagem?",
                "Ficou alguma dúvida? Tô por aqui 😊",
            ]),
        );
        default.insert(
            EscalationTier::Medium,
            strings(&[
                "Só passando pra lembrar que ainda temos horários disponíveis essa semana.",
                "Posso reservar um horário pra você antes que a agenda feche?",
            ]),
        );
        default.insert(
            EscalationTier::High,
            strings(&[
                "A agenda de amanhã está quase cheia. Quer que eu segure uma vaga?",
                "Últimos horários com condição especial hoje. Posso confirmar o seu?",
            ]),
        );
        default.insert(
            EscalationTier::Extreme,
            strings(&[
                "Vou liberar sua vaga em breve. Se ainda quiser, me responde agora que eu garanto pra você!",
            ]),
        );

        let mut archetypes = HashMap::new();
        let mut analytical = TierTable::new();
        analytical.insert(
            EscalationTier::Low,
            strings(&["Se quiser, te mando a tabela completa de valores pra comparar."]),
        );
        analytical.insert(
            EscalationTier::High,
            strings(&["Fechando hoje, o pacote sai mais em conta que o avulso. Quer que eu calcule?"]),
        );
        archetypes.insert(Archetype::Analytical, analytical);

        let mut emotional = TierTable::new();
        emotional.insert(
            EscalationTier::Low,
            strings(&["Seu pet vai ficar lindo e cheiroso! Quer agendar? 🐶"]),
        );
        emotional.insert(
            EscalationTier::High,
            strings(&["A gente cuida dele com todo carinho. Posso guardar um horário especial?"]),
        );
        archetypes.insert(Archetype::Emotional, emotional);

        let mut pragmatic = TierTable::new();
        pragmatic.insert(
            EscalationTier::Medium,
            strings(&["Tenho amanhã 10h ou 15h. Qual prefere?"]),
        );
        archetypes.insert(Archetype::Pragmatic, pragmatic);

        let mut skeptical = TierTable::new();
        skeptical.insert(
            EscalationTier::Medium,
            strings(&["Se quiser, te mando avaliações de outros clientes antes de decidir."]),
        );
        archetypes.insert(Archetype::Skeptical, skeptical);

        Self {
            default,
            archetypes,
            apologies: strings(&[
                "Desculpa a insistência! Não vou mais te mandar mensagens. Quando precisar, estou aqui.",
                "Perdão pelo incômodo, não foi a intenção. Fico à disposição se precisar.",
            ]),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

impl TemplateBook {
    /// Parse a book from YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Pick a follow-up message for `archetype` at `tier`.
    ///
    /// Lookup order: archetype cell, default cell, lower default tiers,
    /// then a fixed last-resort message.
    pub fn select<R: Rng + ?Sized>(
        &self,
        archetype: Archetype,
        tier: EscalationTier,
        rng: &mut R,
    ) -> String {
        let archetype_cell = self
            .archetypes
            .get(&archetype)
            .and_then(|table| table.get(&tier))
            .filter(|variants| !variants.is_empty());
        if let Some(choice) = archetype_cell.and_then(|v| v.choose(rng)) {
            return choice.clone();
        }

        let fallback = EscalationTier::ALL
            .iter()
            .rev()
            .filter(|t| **t <= tier)
            .filter_map(|t| self.default.get(t))
            .find(|variants| !variants.is_empty());
        match fallback.and_then(|v| v.choose(rng)) {
            Some(choice) => choice.clone(),
            None => LAST_RESORT_FOLLOW_UP.to_string(),
        }
    }

    pub fn apology<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.apologies
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| LAST_RESORT_APOLOGY.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_seven_level_tier_mapping() {
        let tiers: Vec<EscalationTier> = (1..=7).map(|l| EscalationTier::for_level(l, 7)).collect();
        assert_eq!(
            tiers,
            vec![
                EscalationTier::Low,
                EscalationTier::Low,
                EscalationTier::Medium,
                EscalationTier::Medium,
                EscalationTier::High,
                EscalationTier::High,
                EscalationTier::Extreme,
            ]
        );
    }

    #[test]
    fn test_tiers_never_decrease() {
        for levels in 1..=10u8 {
            let tiers: Vec<_> = (1..=levels).map(|l| EscalationTier::for_level(l, levels)).collect();
            assert!(tiers.windows(2).all(|w| w[0] <= w[1]), "{:?}", tiers);
            assert_eq!(*tiers.last().unwrap(), EscalationTier::Extreme);
        }
    }

    #[test]
    fn test_engagement_caps_intensity() {
        let config = PersuasionConfig::default();
        assert_eq!(EscalationTier::cap_for_engagement(0.9, &config), EscalationTier::Medium);
        assert_eq!(EscalationTier::cap_for_engagement(0.5, &config), EscalationTier::High);
        assert_eq!(EscalationTier::cap_for_engagement(0.1, &config), EscalationTier::Extreme);
        assert_eq!(EscalationTier::cap_for_engagement(f32::NAN, &config), EscalationTier::High);
    }

    #[test]
    fn test_unknown_archetype_uses_default_set() {
        let book = TemplateBook::default();
        let mut rng = StdRng::seed_from_u64(1);
        let text = book.select(Archetype::Unknown, EscalationTier::Extreme, &mut rng);
        assert!(book.default[&EscalationTier::Extreme].contains(&text));
    }

    #[test]
    fn test_archetype_cell_preferred_over_default() {
        let book = TemplateBook::default();
        let mut rng = StdRng::seed_from_u64(1);
        let text = book.select(Archetype::Pragmatic, EscalationTier::Medium, &mut rng);
        assert_eq!(text, "Tenho amanhã 10h ou 15h. Qual prefere?");
        // No pragmatic wording for the low tier: default set.
        let low = book.select(Archetype::Pragmatic, EscalationTier::Low, &mut rng);
        assert!(book.default[&EscalationTier::Low].contains(&low));
    }

    #[test]
    fn test_yaml_book_falls_back_to_lower_tier_and_last_resort() {
        let yaml = "default:\n  low: [\"oi?\"]\napologies: []\n";
        let book = TemplateBook::from_yaml_str(yaml).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(book.select(Archetype::Emotional, EscalationTier::High, &mut rng), "oi?");
        assert_eq!(book.apology(&mut rng), LAST_RESORT_APOLOGY);

        let empty = TemplateBook::from_yaml_str("{}").unwrap();
        assert_eq!(
            empty.select(Archetype::Unknown, EscalationTier::Low, &mut rng),
            LAST_RESORT_FOLLOW_UP
        );
    }

    #[test]
    fn test_yaml_archetype_keys_parse() {
        let yaml = "archetypes:\n  skeptical:\n    extreme: [\"última chance\"]\n";
        let book = TemplateBook::from_yaml_str(yaml).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(
            book.select(Archetype::Skeptical, EscalationTier::Extreme, &mut rng),
            "última chance"
        );
    }
}
