// gatewally/src/pii/patterns.rs
//
// Regex families + checksum validators for structured PII.
//
// Each regex candidate goes through a kind-specific validator before it
// becomes an entity: TCKN double checksum, ISO-13616 mod-97 for IBAN, Luhn
// for card numbers. Rejected candidates are dropped silently — a string of
// eleven digits that fails the TCKN checksum is just a number.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::types::{PiiEntity, PiiKind};

// ── Compiled patterns ─────────────────────────────────────────────────────────

fn tckn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{11}\b").unwrap())
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\+90\s?)?(\(?\d{3}\)?[\s.-]?)?\d{3}[\s.-]?\d{2}[\s.-]?\d{2}\b").unwrap()
    })
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
    })
}

fn iban_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bTR\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}\b").unwrap()
    })
}

fn credit_card_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b").unwrap())
}

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b\d+[.,]\d{2}\s*(TL|TRY|USD|EUR|GBP)\b").unwrap())
}

// ── Validators ────────────────────────────────────────────────────────────────

/// Turkish national id checksum: with digits d1..d11,
///   d10 = (7·(d1+d3+d5+d7+d9) − (d2+d4+d6+d8)) mod 10
///   d11 = (d1+…+d10) mod 10
pub fn validate_tckn(candidate: &str) -> bool {
    if candidate.len() != 11 || !candidate.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let d: Vec<i32> = candidate.bytes().map(|b| (b - b'0') as i32).collect();

    let sum_first_10: i32 = d[..10].iter().sum();
    if sum_first_10 % 10 != d[10] {
        return false;
    }

    let odd_sum:  i32 = d[0..9].iter().step_by(2).sum();
    let even_sum: i32 = d[1..8].iter().step_by(2).sum();
    (odd_sum * 7 - even_sum).rem_euclid(10) == d[9]
}

/// ISO-13616: move the first four characters to the end, substitute
/// A=10…Z=35, and the resulting number mod 97 must be 1.
pub fn validate_iban(candidate: &str) -> bool {
    let iban: String = candidate
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if iban.len() < 4 {
        return false;
    }

    let rearranged = format!("{}{}", &iban[4..], &iban[..4]);
    let mut remainder: u32 = 0;
    for c in rearranged.chars() {
        if let Some(digit) = c.to_digit(10) {
            remainder = (remainder * 10 + digit) % 97;
        } else if c.is_ascii_uppercase() {
            let value = c as u32 - 'A' as u32 + 10; // two-digit substitution
            remainder = (remainder * 100 + value) % 97;
        } else {
            return false;
        }
    }
    remainder == 1
}

/// Luhn check over the digits, separators stripped.
pub fn luhn_check(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_digit(10))
        .collect::<Option<Vec<_>>>()
        .unwrap_or_default();
    if digits.is_empty() {
        return false;
    }

    let total: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &digit)| {
            if i % 2 == 1 {
                let doubled = digit * 2;
                if doubled < 10 { doubled } else { doubled - 9 }
            } else {
                digit
            }
        })
        .sum();
    total % 10 == 0
}

// ── Detection ─────────────────────────────────────────────────────────────────

fn find_matches(text: &str, re: &Regex, kind: PiiKind, out: &mut Vec<PiiEntity>) {
    for m in re.find_iter(text) {
        let surface = m.as_str();
        let valid = match kind {
            PiiKind::Tckn       => validate_tckn(surface),
            PiiKind::Iban       => validate_iban(surface),
            PiiKind::CreditCard => luhn_check(surface),
            _                   => true,
        };
        if valid {
            out.push(PiiEntity {
                kind,
                text:       surface.to_string(),
                start:      m.start(),
                end:        m.end(),
                confidence: 1.0,
            });
        }
    }
}

/// Run every pattern family over the text. Results are de-duplicated by
/// `(start, end, kind)` and carry confidence 1.0.
pub fn detect_patterns(text: &str) -> Vec<PiiEntity> {
    let mut entities = Vec::new();
    find_matches(text, tckn_re(), PiiKind::Tckn, &mut entities);
    find_matches(text, phone_re(), PiiKind::Phone, &mut entities);
    find_matches(text, email_re(), PiiKind::Email, &mut entities);
    find_matches(text, iban_re(), PiiKind::Iban, &mut entities);
    find_matches(text, credit_card_re(), PiiKind::CreditCard, &mut entities);
    find_matches(text, amount_re(), PiiKind::Amount, &mut entities);

    let mut seen = HashSet::new();
    entities.retain(|e| seen.insert((e.start, e.end, e.kind)));
    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tckn_checksum_accepts_and_rejects() {
        assert!(validate_tckn("10000000146"));
        assert!(validate_tckn("10000000078"));
        assert!(!validate_tckn("12345678901")); // fails the published checksum
        assert!(!validate_tckn("1000000014"));  // too short
        assert!(!validate_tckn("1000000014a"));
    }

    #[test]
    fn iban_mod97_accepts_and_rejects() {
        assert!(validate_iban("TR330006100519786457841326"));
        assert!(validate_iban("TR33 0006 1005 1978 6457 8413 26"));
        assert!(!validate_iban("TR340006100519786457841326"));
        assert!(!validate_iban("TR"));
    }

    #[test]
    fn luhn_accepts_and_rejects() {
        assert!(luhn_check("4532015112830366"));
        assert!(luhn_check("4111 1111 1111 1111"));
        assert!(luhn_check("4532-0151-1283-0366"));
        assert!(!luhn_check("4532015112830367"));
        assert!(!luhn_check("not-a-number"));
    }

    #[test]
    fn fast_path_finds_phone_and_email_only() {
        let text = "My phone is 555-123-4567 and email test@example.com";
        let entities = detect_patterns(text);

        let kinds: Vec<PiiKind> = entities.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&PiiKind::Phone));
        assert!(kinds.contains(&PiiKind::Email));
        assert_eq!(entities.len(), 2);

        let phone = entities.iter().find(|e| e.kind == PiiKind::Phone).unwrap();
        assert_eq!(phone.text, "555-123-4567");
        assert_eq!(&text[phone.start..phone.end], "555-123-4567");
        assert!((phone.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn invalid_checksums_are_dropped() {
        // Eleven digits, but not a TCKN.
        let entities = detect_patterns("id 12345678901 on file");
        assert!(entities.iter().all(|e| e.kind != PiiKind::Tckn));

        // Sixteen digits failing Luhn.
        let entities = detect_patterns("card 4532015112830367 declined");
        assert!(entities.iter().all(|e| e.kind != PiiKind::CreditCard));
    }

    #[test]
    fn valid_tckn_iban_and_card_are_detected() {
        let text = "TCKN 10000000146, IBAN TR33 0006 1005 1978 6457 8413 26, card 4111 1111 1111 1111";
        let entities = detect_patterns(text);
        let kinds: HashSet<PiiKind> = entities.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&PiiKind::Tckn));
        assert!(kinds.contains(&PiiKind::Iban));
        assert!(kinds.contains(&PiiKind::CreditCard));
    }

    #[test]
    fn amounts_match_with_currency_suffix() {
        let entities = detect_patterns("invoice total 1249,99 TL plus 10.50 usd");
        let amounts: Vec<_> = entities.iter().filter(|e| e.kind == PiiKind::Amount).collect();
        assert_eq!(amounts.len(), 2);
    }

    #[test]
    fn offsets_are_valid_byte_positions() {
        let text = "çağrı merkezi: 555-123-4567"; // multi-byte prefix
        for e in detect_patterns(text) {
            assert!(e.start < e.end && e.end <= text.len());
            assert_eq!(&text[e.start..e.end], e.text);
        }
    }
}
