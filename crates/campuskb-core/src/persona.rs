//! Persona configuration passed into prompt assembly.
//!
//! Personas are owned by the settings layer; the pipeline only requires that
//! they arrive validated. Trait weights outside 0..=100 are rejected while
//! deserializing, so an invalid value never reaches the assembler.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Persona identifier. Unknown names map to `Custom`. Names are matched
/// case-insensitively and stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PersonaId {
    Student,
    Faculty,
    Admin,
    Custom(String),
}

impl From<String> for PersonaId {
    fn from(s: String) -> Self {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "student" => Self::Student,
            "faculty" => Self::Faculty,
            "admin" => Self::Admin,
            _ => Self::Custom(name),
        }
    }
}

impl From<PersonaId> for String {
    fn from(id: PersonaId) -> Self {
        id.to_string()
    }
}

impl std::fmt::Display for PersonaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Student => write!(f, "student"),
            Self::Faculty => write!(f, "faculty"),
            Self::Admin => write!(f, "admin"),
            Self::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// A trait weight on the 0–100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "u8")]
pub struct TraitWeight(u8);

impl TraitWeight {
    pub const MAX: u8 = 100;

    pub fn new(value: u8) -> Result<Self> {
        if value > Self::MAX {
            return Err(Error::InvalidConfig(format!(
                "trait weight {} outside 0..=100",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Weight as a fraction in 0.0..=1.0.
    pub fn fraction(self) -> f64 {
        self.0 as f64 / Self::MAX as f64
    }
}

impl TryFrom<f64> for TraitWeight {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self> {
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(Error::InvalidConfig(format!(
                "trait weight {} outside 0..=100",
                value
            )));
        }
        Ok(Self(value.round() as u8))
    }
}

impl From<TraitWeight> for u8 {
    fn from(w: TraitWeight) -> Self {
        w.0
    }
}

impl Default for TraitWeight {
    fn default() -> Self {
        Self(50)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraitWeights {
    #[serde(default)]
    pub helpfulness: TraitWeight,
    #[serde(default)]
    pub creativity: TraitWeight,
    #[serde(default)]
    pub precision: TraitWeight,
    #[serde(default)]
    pub friendliness: TraitWeight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceStyle {
    Concise,
    #[default]
    Conversational,
    Formal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntegrationToggles {
    #[serde(default)]
    pub web_lookup: bool,
    #[serde(default)]
    pub code_support: bool,
    #[serde(default)]
    pub math_solver: bool,
}

/// Validated persona configuration consumed by the context assembler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub persona: PersonaId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
    #[serde(default)]
    pub traits: TraitWeights,
    #[serde(default)]
    pub voice_style: VoiceStyle,
    #[serde(default)]
    pub integrations: IntegrationToggles,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            persona: PersonaId::Student,
            system_prompt_override: None,
            traits: TraitWeights::default(),
            voice_style: VoiceStyle::default(),
            integrations: IntegrationToggles::default(),
        }
    }
}

/// Partial trait update carried by request options.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TraitOverrides {
    pub helpfulness: Option<TraitWeight>,
    pub creativity: Option<TraitWeight>,
    pub precision: Option<TraitWeight>,
    pub friendliness: Option<TraitWeight>,
}

/// Per-request persona options. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersonaOverrides {
    #[serde(default)]
    pub persona: Option<PersonaId>,
    #[serde(default, alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub traits: Option<TraitOverrides>,
    #[serde(default, alias = "voiceStyle")]
    pub voice_style: Option<VoiceStyle>,
    #[serde(default)]
    pub integrations: Option<IntegrationToggles>,
}

impl PersonaConfig {
    pub fn apply(&mut self, overrides: &PersonaOverrides) {
        if let Some(prompt) = &overrides.system_prompt {
            let trimmed = prompt.trim();
            self.system_prompt_override = (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        if let Some(t) = &overrides.traits {
            if let Some(w) = t.helpfulness {
                self.traits.helpfulness = w;
            }
            if let Some(w) = t.creativity {
                self.traits.creativity = w;
            }
            if let Some(w) = t.precision {
                self.traits.precision = w;
            }
            if let Some(w) = t.friendliness {
                self.traits.friendliness = w;
            }
        }
        if let Some(style) = overrides.voice_style {
            self.voice_style = style;
        }
        if let Some(toggles) = overrides.integrations {
            self.integrations = toggles;
        }
    }
}

/// Stored personas, keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct PersonaCatalog {
    personas: HashMap<PersonaId, PersonaConfig>,
}

impl PersonaCatalog {
    /// Load from a JSON array of persona configs. A missing file yields the built-ins.
    pub fn load(path: &Path) -> Result<Self> {
        let mut catalog = Self::builtin();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(catalog),
            Err(e) => return Err(e.into()),
        };
        let stored: Vec<PersonaConfig> = serde_json::from_str(&data).map_err(|e| {
            Error::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        for persona in stored {
            catalog.insert(persona);
        }
        info!("Loaded {} personas from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// Student, faculty and admin with default traits.
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        for persona in [PersonaId::Student, PersonaId::Faculty, PersonaId::Admin] {
            catalog.insert(PersonaConfig {
                persona,
                ..Default::default()
            });
        }
        catalog
    }

    pub fn insert(&mut self, config: PersonaConfig) {
        self.personas.insert(config.persona.clone(), config);
    }

    pub fn get(&self, id: &PersonaId) -> Option<&PersonaConfig> {
        self.personas.get(id)
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    /// Resolve request options into a concrete persona.
    ///
    /// Unknown persona names fall back to the student persona with a warning;
    /// the remaining overrides still apply.
    pub fn resolve(&self, overrides: &PersonaOverrides) -> PersonaConfig {
        let id = overrides.persona.clone().unwrap_or(PersonaId::Student);
        let mut config = match self.get(&id) {
            Some(config) => config.clone(),
            None => {
                warn!("Unknown persona '{}', using student defaults", id);
                self.get(&PersonaId::Student).cloned().unwrap_or_default()
            }
        };
        config.apply(overrides);
        config
    }
}
