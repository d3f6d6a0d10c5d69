//! Qualitative codes and the label-keyed codebook.
//!
//! ## Merging
//!
//! Two codes that name the same concept are merged by [`Code::absorb`]: lists are
//! unioned in order without duplicates and the absorbed label is kept as an
//! alternative. A code absorbed into another during a refinement pass is
//! relabelled [`MERGED_LABEL`] until its stage finishes.
//!
//! ## Persistence
//!
//! [`Codebook::load`] and [`Codebook::save`] pick JSON or YAML from the file
//! extension. On load, both a label-keyed map and a plain list of codes are
//! accepted.

use crate::constants::consolidation::MERGED_LABEL;
use crate::types::error::{LoomError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// =============================================================================
// Code
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Code {
    pub label: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub definitions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<String>,
}

impl Code {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        push_unique(&mut self.definitions, definition.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        push_unique(&mut self.categories, category.into());
        self
    }

    pub fn with_example(mut self, example: impl Into<String>) -> Self {
        push_unique(&mut self.examples, example.into());
        self
    }

    /// Whether this code was absorbed into another one.
    pub fn is_merged(&self) -> bool {
        self.label == MERGED_LABEL
    }

    pub fn has_definition(&self) -> bool {
        self.definitions.iter().any(|d| !d.trim().is_empty())
    }

    pub fn mark_merged(&mut self) {
        self.label = MERGED_LABEL.to_string();
    }

    /// Renames the code, keeping the previous label as an alternative.
    pub fn rename(&mut self, label: impl Into<String>) {
        let label = label.into();
        if label == self.label {
            return;
        }
        let previous = std::mem::replace(&mut self.label, label);
        if !previous.is_empty() && previous != MERGED_LABEL {
            push_unique(&mut self.alternatives, previous);
        }
        self.alternatives.retain(|alt| *alt != self.label);
    }

    /// Unions `other` into `self`.
    pub fn absorb(&mut self, other: Code) {
        if !other.label.is_empty() && other.label != MERGED_LABEL && other.label != self.label {
            push_unique(&mut self.alternatives, other.label);
        }
        for definition in other.definitions {
            push_unique(&mut self.definitions, definition);
        }
        for category in other.categories {
            push_unique(&mut self.categories, category);
        }
        for example in other.examples {
            push_unique(&mut self.examples, example);
        }
        for alternative in other.alternatives {
            if alternative != self.label {
                push_unique(&mut self.alternatives, alternative);
            }
        }
    }
}

fn push_unique(target: &mut Vec<String>, value: String) {
    let value = value.trim();
    if !value.is_empty() && !target.iter().any(|existing| existing == value) {
        target.push(value.to_string());
    }
}

/// Canonical form used to detect labels that only differ in casing or separators.
pub fn normalize_label(label: &str) -> String {
    label
        .to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Codebook
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Codebook {
    codes: BTreeMap<String, Code>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CodebookFile {
    Map(BTreeMap<String, Code>),
    List(Vec<Code>),
}

impl Codebook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a codebook keyed by label. Codes sharing a label are absorbed
    /// into the first one.
    pub fn from_codes(codes: impl IntoIterator<Item = Code>) -> Self {
        let mut codebook = Self::new();
        for code in codes {
            codebook.upsert(code);
        }
        codebook
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&Code> {
        self.codes.get(label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.codes.contains_key(label)
    }

    /// Inserts a code, replacing any code with the same label.
    pub fn insert(&mut self, code: Code) -> Option<Code> {
        self.codes.insert(code.label.clone(), code)
    }

    /// Inserts a code, merging it into an existing code with the same label.
    pub fn upsert(&mut self, code: Code) {
        match self.codes.get_mut(&code.label) {
            Some(existing) => existing.absorb(code),
            None => {
                self.codes.insert(code.label.clone(), code);
            }
        }
    }

    pub fn remove(&mut self, label: &str) -> Option<Code> {
        self.codes.remove(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.codes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Code> {
        self.codes.values()
    }

    /// Codes in label order.
    pub fn codes(&self) -> Vec<Code> {
        self.codes.values().cloned().collect()
    }

    pub fn into_codes(self) -> Vec<Code> {
        self.codes.into_values().collect()
    }

    pub fn merged_count(&self) -> usize {
        self.codes.values().filter(|c| c.is_merged()).count()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: CodebookFile = if is_yaml(path) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        let codes = match file {
            CodebookFile::Map(map) => map
                .into_iter()
                .map(|(key, mut code)| {
                    if code.label.trim().is_empty() {
                        code.label = key;
                    }
                    code
                })
                .collect::<Vec<_>>(),
            CodebookFile::List(list) => list,
        };

        if let Some(unlabelled) = codes.iter().position(|c| c.label.trim().is_empty()) {
            return Err(LoomError::Config(format!(
                "Code #{} in {} has no label",
                unlabelled + 1,
                path.display()
            )));
        }

        Ok(Self::from_codes(codes))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl FromIterator<Code> for Codebook {
    fn from_iter<T: IntoIterator<Item = Code>>(iter: T) -> Self {
        Self::from_codes(iter)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
