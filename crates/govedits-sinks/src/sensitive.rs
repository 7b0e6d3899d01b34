//! Regex scan of edit summaries for phone numbers and street addresses

use regex::Regex;
use tracing::debug;

use govedits_core::traits::{Finding, FindingKind, SensitiveClassifier, SensitivityReport};
use govedits_core::{Error, Result};

/// North American phone numbers, bare or with an area code in parentheses
pub const PHONE_PATTERNS: [&str; 2] = [
    r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b",
    r"\b\(\d{3}\)\s*\d{3}[-.]?\d{4}\b",
];

/// Street addresses and PO boxes
pub const ADDRESS_PATTERNS: [&str; 2] = [
    r"\b\d+\s+[A-Za-z\s]+(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr)\b",
    r"\b(?:PO|P\.O\.) Box\s+\d+\b",
];

/// Pattern-based classifier
#[derive(Debug, Clone)]
pub struct RegexClassifier {
    patterns: Vec<(FindingKind, Regex)>,
}

impl RegexClassifier {
    /// Classifier with the built-in phone and address patterns
    pub fn new() -> Result<Self> {
        let phone = PHONE_PATTERNS.iter().map(|p| (FindingKind::PhoneNumber, *p));
        let address = ADDRESS_PATTERNS.iter().map(|p| (FindingKind::Address, *p));
        Self::with_patterns(phone.chain(address))
    }

    /// Classifier over custom patterns, scanned in the given order
    pub fn with_patterns<'a>(
        patterns: impl IntoIterator<Item = (FindingKind, &'a str)>,
    ) -> Result<Self> {
        let patterns = patterns
            .into_iter()
            .map(|(kind, pattern)| {
                Regex::new(pattern)
                    .map(|re| (kind, re))
                    .map_err(|e| Error::config(format!("Invalid pattern {}: {}", pattern, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

impl SensitiveClassifier for RegexClassifier {
    fn classify(&self, text: &str, excluded: &[String]) -> SensitivityReport {
        let mut findings = Vec::new();

        for (kind, pattern) in &self.patterns {
            for found in pattern.find_iter(text) {
                let matched = found.as_str();
                // revision ids are ten-digit runs too
                if *kind == FindingKind::PhoneNumber && excluded.iter().any(|id| id == matched) {
                    debug!(matched, "Excluded known id from sensitive scan");
                    continue;
                }
                findings.push(Finding {
                    kind: *kind,
                    text: matched.to_string(),
                });
            }
        }

        SensitivityReport { findings }
    }
}
