//! Municipality name normalization.
//!
//! Price tables spell municipalities freely: with or without accents,
//! with the article in front ("El Astillero") or sometimes as a hamlet
//! name ("Ajo"). The boundary document only knows its own `NOMBRE` values,
//! so every price-side name is mapped onto one of those before joining.
//!
//! The mapping rules live in a versioned TOML artifact (`data/aliases.toml`
//! is embedded as the default) and are injected into the [`Normalizer`].

use crate::error::{DashboardError, DashboardResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const EMBEDDED_ALIASES: &str = include_str!("../data/aliases.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Spelling, accent or article-order difference.
    Alias,
    /// A locality folded into the municipality that contains it.
    SubLocality,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NormalizationRule {
    pub observed: String,
    pub canonical: String,
    pub kind: RuleKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliasTable {
    pub version: u32,
    #[serde(default, rename = "rule")]
    pub rules: Vec<NormalizationRule>,
}

impl AliasTable {
    pub fn from_toml_str(content: &str) -> DashboardResult<Self> {
        toml::from_str(content)
            .map_err(|e| DashboardError::Config(format!("Failed to parse alias table: {}", e)))
    }

    pub fn load(path: &Path) -> DashboardResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                DashboardError::MissingSource(format!("alias table {}", path.display()))
            }
            _ => DashboardError::Io(e),
        })?;
        Self::from_toml_str(&content)
    }

    /// The table shipped with the crate.
    pub fn embedded() -> DashboardResult<Self> {
        Self::from_toml_str(EMBEDDED_ALIASES)
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

/// How a name was resolved, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub canonical: String,
    pub via: Option<RuleKind>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    // Keyed by the pre-lookup form (trimmed, optionally accent-stripped).
    lookup: HashMap<String, (String, Option<RuleKind>)>,
    strip_accents: bool,
}

impl Normalizer {
    /// Build a normalizer from an alias table.
    ///
    /// Fails when the rules would make normalization non-idempotent: two
    /// rules sending one name to different places, or a canonical name that
    /// is itself rewritten by another rule.
    pub fn new(table: &AliasTable, strip_accents: bool) -> DashboardResult<Self> {
        let mut normalizer = Self {
            lookup: HashMap::new(),
            strip_accents,
        };

        for rule in &table.rules {
            let key = normalizer.prepare(&rule.observed);
            let target = rule.canonical.trim().to_string();
            match normalizer.lookup.get(&key) {
                Some((existing, _)) if *existing != target => {
                    return Err(DashboardError::AliasConflict(format!(
                        "'{}' maps to both '{}' and '{}'",
                        rule.observed, existing, target
                    )));
                }
                Some(_) => {}
                None => {
                    normalizer.lookup.insert(key, (target, Some(rule.kind)));
                }
            }
        }

        let targets: Vec<String> = normalizer
            .lookup
            .values()
            .map(|(target, _)| target.clone())
            .collect();
        for target in targets {
            let key = normalizer.prepare(&target);
            match normalizer.lookup.get(&key) {
                Some((existing, _)) if *existing != target => {
                    return Err(DashboardError::AliasConflict(format!(
                        "canonical name '{}' is rewritten to '{}'",
                        target, existing
                    )));
                }
                Some(_) => {}
                None => {
                    normalizer.lookup.insert(key, (target, None));
                }
            }
        }

        debug!(
            version = table.version,
            entries = normalizer.lookup.len(),
            strip_accents,
            "Alias table loaded"
        );
        Ok(normalizer)
    }

    /// Register boundary names as mapping to themselves.
    ///
    /// Without this, an accent-stripped price name only finds its accented
    /// boundary name through an explicit rule. Names whose pre-lookup form
    /// is already taken by a different canonical name are skipped and
    /// returned.
    pub fn anchor<'a, I>(&mut self, canonical_names: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut skipped = Vec::new();
        for name in canonical_names {
            let key = self.prepare(name);
            match self.lookup.get(&key) {
                Some((existing, _)) if existing != name => {
                    warn!(name, existing = %existing, "Boundary name shadowed by alias table");
                    skipped.push(name.to_string());
                }
                Some(_) => {}
                None => {
                    self.lookup.insert(key, (name.to_string(), None));
                }
            }
        }
        skipped
    }

    /// Canonical name for `name`; `None` stays `None`.
    pub fn normalize(&self, name: Option<&str>) -> Option<String> {
        name.map(|n| self.normalize_str(n))
    }

    pub fn normalize_str(&self, name: &str) -> String {
        self.resolve(name).canonical
    }

    pub fn resolve(&self, name: &str) -> Resolution {
        let key = self.prepare(name);
        match self.lookup.get(&key) {
            Some((canonical, via)) => Resolution {
                canonical: canonical.clone(),
                via: *via,
            },
            None => Resolution {
                canonical: key,
                via: None,
            },
        }
    }

    fn prepare(&self, name: &str) -> String {
        let trimmed = name.trim();
        if self.strip_accents {
            strip_diacritics(trimmed)
        } else {
            trimmed.nfc().collect()
        }
    }
}

/// Remove combining marks after canonical decomposition ("Peñarrubia" ->
/// "Penarrubia").
pub fn strip_diacritics(s: &str) -> String {
    s.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedded(strip_accents: bool) -> Normalizer {
        Normalizer::new(&AliasTable::embedded().unwrap(), strip_accents).unwrap()
    }

    #[test]
    fn embedded_table_examples() {
        for strip in [true, false] {
            let n = embedded(strip);
            assert_eq!(n.normalize_str("El Astillero"), "Astillero (El)");
            assert_eq!(n.normalize_str("Ajo"), "Bareyo");
            assert_eq!(n.normalize_str("Cabezon de la Sal"), "Cabezón de la Sal");
            assert_eq!(n.normalize_str("  Penarrubia "), "Peñarrubia");
        }
    }

    #[test]
    fn accent_stripping_covers_both_spellings() {
        let n = embedded(true);
        assert_eq!(n.normalize_str("Cabezón de la Sal"), "Cabezón de la Sal");
        assert_eq!(n.normalize_str("Maliaño"), "Camargo");
        assert_eq!(n.normalize_str("Maliano"), "Camargo");
        // Unknown names come back stripped.
        assert_eq!(n.normalize_str("Santoña"), "Santona");
    }

    #[test]
    fn none_passes_through() {
        assert_eq!(embedded(true).normalize(None), None);
        assert_eq!(
            embedded(true).normalize(Some("Ajo")),
            Some("Bareyo".to_string())
        );
    }

    #[test]
    fn idempotent_over_samples() {
        let samples = [
            "El Astillero",
            "Astillero (El)",
            "Ajo",
            "Güemes",
            "Cabezon de la Sal",
            "Cabezón de Liébana",
            "Santoña",
            "",
            "   ",
            "Valle de Cabuerniga",
            "Ca\u{0301}bue\u{0301}rniga",
            "Torrelavega",
        ];
        for strip in [true, false] {
            let n = embedded(strip);
            for s in samples {
                let once = n.normalize_str(s);
                assert_eq!(n.normalize_str(&once), once, "not idempotent for {:?}", s);
            }
        }
    }

    #[test]
    fn sub_locality_resolution_is_reported() {
        let n = embedded(true);
        let r = n.resolve("Somo");
        assert_eq!(r.canonical, "Ribamontán al Mar");
        assert_eq!(r.via, Some(RuleKind::SubLocality));
        assert_eq!(n.resolve("El Astillero").via, Some(RuleKind::Alias));
        assert_eq!(n.resolve("Laredo").via, None);
    }

    #[test]
    fn conflicting_rules_are_rejected() {
        let table = AliasTable::from_toml_str(
            r#"
            version = 1
            [[rule]]
            observed = "Ajo"
            canonical = "Bareyo"
            kind = "sub_locality"
            [[rule]]
            observed = "Ajo"
            canonical = "Arnuero"
            kind = "sub_locality"
            "#,
        )
        .unwrap();
        assert!(matches!(
            Normalizer::new(&table, true),
            Err(DashboardError::AliasConflict(_))
        ));
    }

    #[test]
    fn chained_rules_are_rejected() {
        let table = AliasTable::from_toml_str(
            r#"
            version = 1
            [[rule]]
            observed = "Guemes"
            canonical = "Ajo"
            kind = "alias"
            [[rule]]
            observed = "Ajo"
            canonical = "Bareyo"
            kind = "sub_locality"
            "#,
        )
        .unwrap();
        assert!(Normalizer::new(&table, false).is_err());
    }

    #[test]
    fn accent_collision_in_targets_is_rejected() {
        // Stripped, "Penagos" and "Peñagos" collide.
        let table = AliasTable::from_toml_str(
            r#"
            version = 1
            [[rule]]
            observed = "A"
            canonical = "Penagos"
            kind = "alias"
            [[rule]]
            observed = "B"
            canonical = "Peñagos"
            kind = "alias"
            "#,
        )
        .unwrap();
        assert!(Normalizer::new(&table, true).is_err());
        assert!(Normalizer::new(&table, false).is_ok());
    }

    #[test]
    fn anchoring_matches_accented_boundary_names() {
        let table = AliasTable::from_toml_str("version = 1").unwrap();
        let mut n = Normalizer::new(&table, true).unwrap();
        assert_eq!(n.normalize_str("Santoña"), "Santona");

        let skipped = n.anchor(["Santoña", "Laredo"]);
        assert!(skipped.is_empty());
        assert_eq!(n.normalize_str("Santoña"), "Santoña");
        assert_eq!(n.normalize_str("Santona"), "Santoña");
        assert_eq!(n.normalize_str("Laredo"), "Laredo");
    }

    #[test]
    fn anchor_skips_names_taken_by_aliases() {
        let mut n = embedded(true);
        let skipped = n.anchor(["Astillero", "Bareyo"]);
        assert_eq!(skipped, vec!["Astillero".to_string()]);
        assert_eq!(n.normalize_str("Astillero"), "Astillero (El)");
    }

    #[test]
    fn strip_diacritics_handles_tilde() {
        assert_eq!(strip_diacritics("Peñarrubia"), "Penarrubia");
        assert_eq!(strip_diacritics("Liébana"), "Liebana");
    }
}
