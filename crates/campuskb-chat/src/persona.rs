//! Persona-driven prompting: system instructions and sampling temperature.

use campuskb_core::{PersonaConfig, PersonaId, TraitWeight, VoiceStyle};

const MIN_TEMPERATURE: f64 = 0.2;
const MAX_TEMPERATURE: f64 = 1.0;

/// Instruction appended when the prompt carries grounding.
pub const GROUNDED_RULES: &str = "Answer from the reference material below and cite it with its \
     [n] marker. If the material does not contain the answer, say that you do not know instead \
     of guessing.";

/// Instruction used when retrieval found nothing relevant.
pub const UNGROUNDED_RULES: &str = "No reference material matched this question. Say plainly \
     that the campus knowledge base does not cover it and decline to invent specifics such as \
     dates, times, fees, rooms or names.";

/// Rules for a programming question answered without campus material.
pub fn code_rules(language: Option<&str>) -> String {
    let mut rules = String::from(
        "This is a programming question; the campus knowledge base is not consulted. Explain \
         the concept or the fix step by step and put all code in fenced blocks.",
    );
    if let Some(language) = language {
        rules.push_str(&format!(" The question concerns {}.", language));
    }
    rules
}

/// Creativity 0..=100 maps linearly onto 0.2..=1.0.
pub fn temperature(persona: &PersonaConfig) -> f64 {
    MIN_TEMPERATURE + (MAX_TEMPERATURE - MIN_TEMPERATURE) * persona.traits.creativity.fraction()
}

/// System instructions for a persona, without the grounding rules.
pub fn instructions(persona: &PersonaConfig) -> String {
    let mut lines = vec![match &persona.system_prompt_override {
        Some(custom) => custom.clone(),
        None => role_preamble(&persona.persona),
    }];

    lines.push(voice_guidance(persona.voice_style).to_string());

    let traits = &persona.traits;
    if let Some(line) = graded(
        traits.helpfulness,
        "Anticipate the obvious follow-up and point to the next step.",
        "Answer only what was asked.",
    ) {
        lines.push(line.to_string());
    }
    if let Some(line) = graded(
        traits.precision,
        "Quote exact figures, dates and names from the material.",
        "Summarize rather than quoting details.",
    ) {
        lines.push(line.to_string());
    }
    if let Some(line) = graded(
        traits.friendliness,
        "Use a warm, encouraging tone.",
        "Keep the tone neutral.",
    ) {
        lines.push(line.to_string());
    }

    let integrations = &persona.integrations;
    if integrations.code_support {
        lines.push("Format code in fenced blocks.".into());
    }
    if integrations.math_solver {
        lines.push("Show the working for any calculation.".into());
    }
    if !integrations.web_lookup {
        lines.push("Do not refer the user to web searches you cannot perform.".into());
    }

    lines.join("\n")
}

fn role_preamble(id: &PersonaId) -> String {
    match id {
        PersonaId::Student => {
            "You are the campus assistant. You help students with courses, schedules, \
             deadlines and campus services."
                .into()
        }
        PersonaId::Faculty => {
            "You are the campus assistant for faculty. You help with academic policy, \
             course administration and institutional procedures."
                .into()
        }
        PersonaId::Admin => {
            "You are the campus assistant for administrative staff. You help with \
             operations, procedures and institutional records."
                .into()
        }
        PersonaId::Custom(name) => format!("You are the campus assistant acting as {}.", name),
    }
}

fn voice_guidance(style: VoiceStyle) -> &'static str {
    match style {
        VoiceStyle::Concise => "Keep answers short: a few sentences or a brief list.",
        VoiceStyle::Conversational => "Write in a natural, conversational style.",
        VoiceStyle::Formal => "Use formal, professional language.",
    }
}

/// High (>= 70) and low (<= 30) weights add guidance; the middle adds none.
fn graded(weight: TraitWeight, high: &'static str, low: &'static str) -> Option<&'static str> {
    match weight.value() {
        70..=100 => Some(high),
        0..=30 => Some(low),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_range() {
        let mut persona = PersonaConfig::default();
        persona.traits.creativity = TraitWeight::new(0).unwrap();
        assert!((temperature(&persona) - 0.2).abs() < 1e-9);
        persona.traits.creativity = TraitWeight::new(100).unwrap();
        assert!((temperature(&persona) - 1.0).abs() < 1e-9);
        persona.traits.creativity = TraitWeight::new(50).unwrap();
        assert!((temperature(&persona) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_override_replaces_preamble() {
        let persona = PersonaConfig {
            system_prompt_override: Some("You staff the library desk.".into()),
            ..Default::default()
        };
        let text = instructions(&persona);
        assert!(text.starts_with("You staff the library desk."));
        assert!(!text.contains("help students"));
    }

    #[test]
    fn test_code_rules_name_language() {
        assert!(code_rules(Some("python")).ends_with("concerns python."));
        assert!(!code_rules(None).contains("concerns"));
    }

    #[test]
    fn test_traits_and_voice() {
        let mut persona = PersonaConfig {
            persona: PersonaId::Faculty,
            voice_style: VoiceStyle::Formal,
            ..Default::default()
        };
        persona.traits.precision = TraitWeight::new(90).unwrap();
        persona.traits.friendliness = TraitWeight::new(10).unwrap();
        let text = instructions(&persona);
        assert!(text.contains("for faculty"));
        assert!(text.contains("formal, professional"));
        assert!(text.contains("Quote exact figures"));
        assert!(text.contains("neutral"));
        assert!(!text.contains("follow-up"));
    }
}
