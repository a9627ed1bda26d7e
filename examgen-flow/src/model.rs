use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// A backend model that can serve a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Descriptor whose display name is the id itself.
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
        }
    }
}

/// Built-in fallback order, fastest model first.
pub fn default_models() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::new("gemini-2.5-flash", "Gemini 2.5 Flash"),
        ModelDescriptor::new("gemini-2.5-pro", "Gemini 2.5 Pro"),
        ModelDescriptor::new("gemini-2.0-flash", "Gemini 2.0 Flash"),
    ]
}

/// Ordered list of models consulted top-to-bottom when a step fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPriority {
    models: Vec<ModelDescriptor>,
}

impl ModelPriority {
    pub fn new(models: Vec<ModelDescriptor>) -> Result<Self> {
        if models.is_empty() {
            return Err(FlowError::NoModels);
        }
        Ok(Self { models })
    }

    /// Moves the preferred model to the front, keeping the relative order of the rest.
    /// An id that is not in the list is inserted at the front.
    pub fn with_preferred(mut self, preferred: &str) -> Self {
        let chosen = match self.models.iter().position(|m| m.id == preferred) {
            Some(pos) => self.models.remove(pos),
            None => ModelDescriptor::from_id(preferred),
        };
        self.models.insert(0, chosen);
        self
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn get(&self, index: usize) -> Option<&ModelDescriptor> {
        self.models.get(index)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 >= self.models.len()
    }
}

impl Default for ModelPriority {
    fn default() -> Self {
        Self {
            models: default_models(),
        }
    }
}
