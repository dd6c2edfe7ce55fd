//! Validation of user supplied label keys, label values, selectors and
//! resource quantities
//!
//! These mirror the API server's own rules so bad metadata is rejected (or
//! skipped) before anything is written to the cluster.

/// Maximum length of a label value or the name part of a qualified name
const MAX_NAME_LEN: usize = 63;
/// Maximum length of a DNS-1123 subdomain (label key prefix)
const MAX_SUBDOMAIN_LEN: usize = 253;

/// Binary and decimal SI suffixes accepted on quantities
const QUANTITY_SUFFIXES: &[&str] = &[
    "", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "n", "u", "m", "k", "M", "G", "T", "P", "E",
];

/// Name part of a qualified name or a non-empty label value
///
/// At most 63 characters, alphanumeric at both ends, with `-`, `_` and `.`
/// allowed in between.
fn validate_name_part(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("name part must be non-empty".to_string());
    }
    if s.len() > MAX_NAME_LEN {
        return Err(format!(
            "name part must be no more than {MAX_NAME_LEN} characters: {s}"
        ));
    }

    let bytes = s.as_bytes();
    let alnum_ends = bytes[0].is_ascii_alphanumeric() && bytes[bytes.len() - 1].is_ascii_alphanumeric();
    let valid_chars = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !alnum_ends || !valid_chars {
        return Err(format!(
            "must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character: {s}"
        ));
    }
    Ok(())
}

/// DNS-1123 subdomain, used as the optional prefix of a qualified name
fn validate_dns_subdomain(s: &str) -> Result<(), String> {
    if s.is_empty() || s.len() > MAX_SUBDOMAIN_LEN {
        return Err(format!(
            "prefix must be a DNS subdomain of 1 to {MAX_SUBDOMAIN_LEN} characters: {s}"
        ));
    }
    for segment in s.split('.') {
        let ok = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !segment.starts_with('-')
            && !segment.ends_with('-');
        if !ok {
            return Err(format!(
                "prefix must be lowercase alphanumeric segments separated by '.': {s}"
            ));
        }
    }
    Ok(())
}

/// Validate a label or annotation key: `[prefix/]name`
pub fn validate_qualified_name(key: &str) -> Result<(), String> {
    match key.split_once('/') {
        Some((prefix, name)) => {
            validate_dns_subdomain(prefix)?;
            if name.contains('/') {
                return Err(format!("qualified name has more than one '/': {key}"));
            }
            validate_name_part(name)
        }
        None => validate_name_part(key),
    }
}

/// Validate a label value; empty values are allowed
pub fn validate_label_value(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    validate_name_part(value)
}

/// Validate an equality-based selector such as `a=b,c=d`
pub fn validate_label_selector(selector: &str) -> Result<(), String> {
    if selector.is_empty() {
        return Err("label selector cannot be empty".to_string());
    }
    for requirement in selector.split(',') {
        let (key, value) = requirement
            .split_once("==")
            .or_else(|| requirement.split_once('='))
            .ok_or_else(|| format!("selector requirement is not key=value: {requirement}"))?;
        validate_qualified_name(key.trim())?;
        validate_label_value(value.trim())?;
    }
    Ok(())
}

/// Validate a resource quantity such as `500m`, `1Gi` or `1e3`
pub fn validate_quantity(q: &str) -> Result<(), String> {
    let invalid = || format!("quantities must match the regular expression '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$': {q}");

    let unsigned = q.strip_prefix(['+', '-']).unwrap_or(q);
    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return Err(invalid());
    }

    if QUANTITY_SUFFIXES.contains(&suffix) {
        return Ok(());
    }

    // Decimal exponent: e/E followed by an optionally signed integer
    match suffix.strip_prefix(['e', 'E']) {
        Some(exp) => {
            let digits = exp.strip_prefix(['+', '-']).unwrap_or(exp);
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                Ok(())
            } else {
                Err(invalid())
            }
        }
        None => Err(invalid()),
    }
}
