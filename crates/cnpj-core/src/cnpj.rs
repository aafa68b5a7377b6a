//! Identifier codec for 14-character alphanumeric CNPJs.
//!
//! A full identifier is an 8-character base (`basico`), a 4-character order
//! (`ordem`) and a 2-digit check (`dv`). Cosmetic masks use `.`, `/` and `-`.
//! The first two characters of the base are the partition prefix used across
//! the on-disk dataset.

use crate::error::EtlError;

/// Parts of a full identifier: base (8), order (4), check digits (2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnpjParts {
    pub basico: String,
    pub ordem: String,
    pub dv: String,
}

impl CnpjParts {
    /// The 14-character concatenated identifier.
    pub fn full(&self) -> String {
        format!("{}{}{}", self.basico, self.ordem, self.dv)
    }

    /// Partition prefix: first two characters of the base.
    pub fn prefix(&self) -> &str {
        &self.basico[..2]
    }
}

/// Remove mask characters (`.`, `/`, `-`) and uppercase.
///
/// Empty or whitespace-only input yields an empty string.
pub fn strip(cnpj: &str) -> String {
    if cnpj.trim().is_empty() {
        return String::new();
    }
    cnpj.chars()
        .filter(|c| !matches!(c, '.' | '/' | '-'))
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Validate an identifier: after stripping it must be 12 alphanumerics
/// followed by 2 digits, and not a run of a single repeated character.
/// Characters outside `[A-Za-z0-9./-]` anywhere in the input are rejected.
pub fn is_valid(cnpj: &str) -> bool {
    if cnpj.trim().is_empty() {
        return false;
    }
    if cnpj
        .chars()
        .any(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '/' | '-'))
    {
        return false;
    }

    let raw = strip(cnpj);
    if raw.len() != 14 {
        return false;
    }

    let bytes = raw.as_bytes();
    let shape_ok = bytes[..12].iter().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        && bytes[12..].iter().all(|b| b.is_ascii_digit());
    if !shape_ok {
        return false;
    }

    !is_repeated_sequence(&raw)
}

fn is_repeated_sequence(raw: &str) -> bool {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => chars.all(|c| c == first),
        None => false,
    }
}

/// Split an identifier into its parts, stripping the mask first.
pub fn parse(cnpj: &str) -> Result<CnpjParts, EtlError> {
    let raw = strip(cnpj);
    if raw.len() != 14 {
        return Err(EtlError::MalformedCnpj(format!(
            "expected 14 characters after removing mask, got {}",
            raw.len()
        )));
    }
    Ok(CnpjParts {
        basico: raw[..8].to_string(),
        ordem: raw[8..12].to_string(),
        dv: raw[12..14].to_string(),
    })
}

/// Partition prefix of an already-stripped identifier.
pub fn prefix(raw: &str) -> &str {
    &raw[..2.min(raw.len())]
}

/// The hundred partition prefixes, `00` through `99`.
pub fn all_prefixes() -> Vec<String> {
    (0..100).map(|i| format!("{i:02}")).collect()
}
