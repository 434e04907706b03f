// gatewally/src/pii/detector.rs
//
// Two-mode PII detector.
//
//   fast     — pattern families only (sub-millisecond)
//   detailed — patterns ∪ named-entity extraction, language-dispatched
//
// The extractor is an injected capability: the gateway never links an NLP
// runtime. When none is wired in, detailed mode silently degrades to the
// pattern families.

use std::sync::Arc;
use std::time::Instant;

use crate::pii::patterns::detect_patterns;
use crate::types::{DetectionMode, DetectionResult, PiiEntity, PiiKind};

// ── Extractor capability ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language { Turkish, English }

/// A raw span from the extractor, still carrying the extractor's own label
/// vocabulary (PERSON, ORG, GPE, LOC, MONEY, DATE).
#[derive(Debug, Clone)]
pub struct RawNerEntity {
    pub label: String,
    pub text:  String,
    pub start: usize,
    pub end:   usize,
}

pub trait NamedEntityExtractor: Send + Sync {
    fn extract(&self, text: &str, language: Language) -> Vec<RawNerEntity>;
}

// ── Detector ──────────────────────────────────────────────────────────────────

const TURKISH_CHARS: &str = "çğıöşüÇĞIİÖŞÜ";

pub struct PiiDetector {
    extractor: Option<Arc<dyn NamedEntityExtractor>>,
}

impl PiiDetector {
    pub fn new(extractor: Option<Arc<dyn NamedEntityExtractor>>) -> Self {
        Self { extractor }
    }

    pub fn detect(&self, text: &str, mode: DetectionMode) -> DetectionResult {
        let started = Instant::now();

        let entities = match mode {
            DetectionMode::Fast     => detect_patterns(text),
            DetectionMode::Detailed => self.detect_detailed(text),
        };

        DetectionResult {
            entities,
            mode,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    fn detect_detailed(&self, text: &str) -> Vec<PiiEntity> {
        let mut entities = detect_patterns(text);

        let extractor = match &self.extractor {
            Some(e) => e,
            None    => return entities, // degrade to patterns only
        };

        let language = detect_language(text);
        for raw in extractor.extract(text, language) {
            let kind = match map_label(&raw.label) {
                Some(k) => k,
                None    => continue,
            };

            // Pattern hits win over extractor spans on any intersection.
            let overlaps = entities
                .iter()
                .any(|e| (e.start <= raw.start && raw.start < e.end)
                      || (e.start < raw.end && raw.end <= e.end));
            if overlaps {
                continue;
            }

            let confidence = match raw.label.as_str() {
                "PERSON" | "ORG" => 0.8,
                _                => 0.9,
            };
            entities.push(PiiEntity {
                kind,
                text: raw.text,
                start: raw.start,
                end: raw.end,
                confidence,
            });
        }

        entities.sort_by_key(|e| e.start);
        merge_overlapping(entities)
    }
}

pub fn detect_language(text: &str) -> Language {
    if text.chars().any(|c| TURKISH_CHARS.contains(c)) {
        Language::Turkish
    } else {
        Language::English
    }
}

fn map_label(label: &str) -> Option<PiiKind> {
    match label {
        "PERSON"        => Some(PiiKind::Person),
        "ORG"           => Some(PiiKind::Organization),
        "GPE" | "LOC"   => Some(PiiKind::Location),
        "MONEY"         => Some(PiiKind::Amount),
        "DATE"          => Some(PiiKind::Date),
        _               => None,
    }
}

/// Input must be sorted by start. Overlapping neighbours collapse to the
/// higher-confidence entity.
fn merge_overlapping(entities: Vec<PiiEntity>) -> Vec<PiiEntity> {
    let mut merged: Vec<PiiEntity> = Vec::with_capacity(entities.len());
    for entity in entities {
        match merged.last_mut() {
            Some(last) if entity.start < last.end => {
                if entity.confidence > last.confidence {
                    *last = entity;
                }
            }
            _ => merged.push(entity),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tiny lookup-table extractor standing in for the NLP capability.
    struct TableExtractor {
        names: Vec<(&'static str, &'static str)>, // (surface, label)
    }

    impl NamedEntityExtractor for TableExtractor {
        fn extract(&self, text: &str, _language: Language) -> Vec<RawNerEntity> {
            let mut out = Vec::new();
            for (surface, label) in &self.names {
                if let Some(start) = text.find(surface) {
                    out.push(RawNerEntity {
                        label: label.to_string(),
                        text:  surface.to_string(),
                        start,
                        end:   start + surface.len(),
                    });
                }
            }
            out
        }
    }

    #[test]
    fn fast_mode_never_consults_the_extractor() {
        struct Panicking;
        impl NamedEntityExtractor for Panicking {
            fn extract(&self, _: &str, _: Language) -> Vec<RawNerEntity> {
                panic!("fast mode must not reach the extractor");
            }
        }
        let detector = PiiDetector::new(Some(Arc::new(Panicking)));
        let result = detector.detect("call 555-123-4567", DetectionMode::Fast);
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.mode, DetectionMode::Fast);
    }

    #[test]
    fn detailed_without_extractor_degrades_to_patterns() {
        let detector = PiiDetector::new(None);
        let result = detector.detect("reach me at test@example.com", DetectionMode::Detailed);
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].kind, PiiKind::Email);
    }

    #[test]
    fn detailed_merges_extractor_entities() {
        let detector = PiiDetector::new(Some(Arc::new(TableExtractor {
            names: vec![("Ada Lovelace", "PERSON"), ("Ankara", "GPE")],
        })));
        let result = detector.detect(
            "Ada Lovelace wrote from Ankara, email test@example.com",
            DetectionMode::Detailed,
        );

        let kinds: Vec<PiiKind> = result.entities.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![PiiKind::Person, PiiKind::Location, PiiKind::Email]);

        let person = &result.entities[0];
        assert!((person.confidence - 0.8).abs() < 1e-6);
        let location = &result.entities[1];
        assert!((location.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn extractor_spans_lose_to_pattern_hits_on_overlap() {
        // The extractor claims the whole phrase including the email; the
        // pattern hit on the email must survive untouched.
        let detector = PiiDetector::new(Some(Arc::new(TableExtractor {
            names: vec![("test@example.com is Ada", "PERSON")],
        })));
        let result = detector.detect("test@example.com is Ada", DetectionMode::Detailed);
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].kind, PiiKind::Email);
    }

    #[test]
    fn language_dispatch_is_character_driven() {
        assert_eq!(detect_language("merhaba dünya, görüşürüz"), Language::Turkish);
        assert_eq!(detect_language("hello there"), Language::English);
    }
}
