//! Capability map: which service capability a need category maps onto.

use std::collections::BTreeMap;

use crate::config::CapabilityConfig;

/// How a category matched a capability.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityMatch {
    /// Category equals a capability name or one of its aliases.
    Direct(String),
    /// Category is close to a capability name or alias (Jaro-Winkler).
    Fuzzy { capability: String, score: f64 },
    None,
}

impl CapabilityMatch {
    pub fn capability(&self) -> Option<&str> {
        match self {
            CapabilityMatch::Direct(c) => Some(c),
            CapabilityMatch::Fuzzy { capability, .. } => Some(capability),
            CapabilityMatch::None => None,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, CapabilityMatch::Direct(_))
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityMap {
    /// Capability name -> normalised names it answers to (itself included).
    entries: BTreeMap<String, Vec<String>>,
    fuzzy_threshold: f64,
}

fn normalise(term: &str) -> String {
    term.trim().to_lowercase().replace(['_', '-'], " ")
}

impl CapabilityMap {
    pub fn from_config(config: &CapabilityConfig) -> Self {
        let entries = config
            .entries
            .iter()
            .map(|(name, aliases)| {
                let mut terms = vec![normalise(name)];
                for alias in aliases {
                    let alias = normalise(alias);
                    if !alias.is_empty() && !terms.contains(&alias) {
                        terms.push(alias);
                    }
                }
                (name.clone(), terms)
            })
            .collect();
        Self {
            entries,
            fuzzy_threshold: config.fuzzy_threshold,
        }
    }

    /// Resolve a category. Exact matches win over fuzzy ones; among fuzzy
    /// candidates the highest score wins, capability name breaking ties.
    pub fn resolve(&self, category: &str) -> CapabilityMatch {
        let needle = normalise(category);
        if needle.is_empty() {
            return CapabilityMatch::None;
        }

        for (name, terms) in &self.entries {
            if terms.iter().any(|t| *t == needle) {
                return CapabilityMatch::Direct(name.clone());
            }
        }

        let mut best: Option<(&String, f64)> = None;
        for (name, terms) in &self.entries {
            for term in terms {
                let score = strsim::jaro_winkler(&needle, term);
                if score >= self.fuzzy_threshold && best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((name, score));
                }
            }
        }

        match best {
            Some((name, score)) => CapabilityMatch::Fuzzy {
                capability: name.clone(),
                score,
            },
            None => CapabilityMatch::None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CapabilityMap {
    fn default() -> Self {
        Self::from_config(&CapabilityConfig::default())
    }
}
