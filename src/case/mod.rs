//! Case state as the hosting application holds it, and the snapshot the
//! analysis pipeline builds from it.
//!
//! The application stores a case as a loose JSON object edited by its forms.
//! The pipeline never reads that object directly: it asks a [`CaseState`]
//! for the current fields and assembles an immutable [`CaseSnapshot`].

pub mod snapshot;

pub use snapshot::*;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field keys the assembler understands.
pub mod keys {
    pub const NARRATIVE: &str = "narrative";
    pub const CHIEF_COMPLAINTS: &str = "chief_complaints";
    pub const PHYSICAL_GENERALS: &str = "physical_generals";
    pub const MENTAL_EMOTIONAL: &str = "mental_emotional";
    pub const KEY_SYMPTOMS: &str = "key_symptoms";
}

/// The in-memory case field map, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseFields(pub Map<String, Value>);

impl CaseFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Builder-style setter used by forms and tests.
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }
}

impl From<Map<String, Value>> for CaseFields {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Case-state collaborator: whoever owns the live case exposes its fields here.
pub trait CaseState {
    fn current_fields(&self) -> CaseFields;
}

impl CaseState for CaseFields {
    fn current_fields(&self) -> CaseFields {
        self.clone()
    }
}
