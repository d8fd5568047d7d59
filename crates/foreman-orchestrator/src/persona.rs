use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Model settings carried by a persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Provider-specific settings not modelled above.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Template describing an agent's capabilities, model and constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    /// Registry lookup key, e.g. `researcher` or `writer`.
    pub persona_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model_config: ModelConfig,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl Persona {
    pub fn new(id: impl Into<String>, persona_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            persona_type: persona_type.into(),
            description: String::new(),
            system_prompt: String::new(),
            model_config: ModelConfig::default(),
            capabilities: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

/// Partial model settings applied on top of a persona's [`ModelConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigOverride {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Caller-supplied adjustments to a resolved persona.
///
/// There is no `id` field: an override can reshape a persona but never give
/// it a new registry identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaOverride {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub persona_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model_config: Option<ModelConfigOverride>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// Derive a persona from `base` and `overrides`.
///
/// | field                                   | rule                              |
/// |-----------------------------------------|-----------------------------------|
/// | `id`                                    | always the base id                |
/// | `name`, `persona_type`, `description`, `system_prompt` | override replaces when set |
/// | `model_config.model/temperature/max_tokens` | override replaces when set    |
/// | `model_config.extra`                    | key-wise, override keys win       |
/// | `capabilities`, `constraints`           | base then override, concatenated  |
///
/// The base is never modified; the result is always a fresh copy.
pub fn merge_persona(base: &Persona, overrides: &PersonaOverride) -> Persona {
    let mut merged = base.clone();

    if let Some(name) = &overrides.name {
        merged.name = name.clone();
    }
    if let Some(persona_type) = &overrides.persona_type {
        merged.persona_type = persona_type.clone();
    }
    if let Some(description) = &overrides.description {
        merged.description = description.clone();
    }
    if let Some(prompt) = &overrides.system_prompt {
        merged.system_prompt = prompt.clone();
    }

    if let Some(model) = &overrides.model_config {
        if let Some(name) = &model.model {
            merged.model_config.model = name.clone();
        }
        if let Some(temperature) = model.temperature {
            merged.model_config.temperature = temperature;
        }
        if let Some(max_tokens) = model.max_tokens {
            merged.model_config.max_tokens = max_tokens;
        }
        for (key, value) in &model.extra {
            merged.model_config.extra.insert(key.clone(), value.clone());
        }
    }

    merged
        .capabilities
        .extend(overrides.capabilities.iter().cloned());
    merged
        .constraints
        .extend(overrides.constraints.iter().cloned());

    merged.id = base.id.clone();
    merged
}

/// Read-only source of persona templates.
pub trait PersonaRegistry: Send + Sync {
    fn get(&self, id: &str) -> Option<Persona>;
    fn get_by_type(&self, persona_type: &str) -> Option<Persona>;
}

/// Registry backed by an in-process map, populated by the embedding
/// application.
#[derive(Default)]
pub struct InMemoryPersonaRegistry {
    personas: RwLock<HashMap<String, Persona>>,
}

impl InMemoryPersonaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a persona under its id.
    pub fn register(&self, persona: Persona) {
        self.personas.write().insert(persona.id.clone(), persona);
    }

    pub fn len(&self) -> usize {
        self.personas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.read().is_empty()
    }
}

impl PersonaRegistry for InMemoryPersonaRegistry {
    fn get(&self, id: &str) -> Option<Persona> {
        self.personas.read().get(id).cloned()
    }

    /// First persona of the type, by id order so lookups are deterministic.
    fn get_by_type(&self, persona_type: &str) -> Option<Persona> {
        let personas = self.personas.read();
        let mut matches: Vec<&Persona> = personas
            .values()
            .filter(|p| p.persona_type == persona_type)
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches.first().map(|p| (*p).clone())
    }
}
