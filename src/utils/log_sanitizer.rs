// ============================================================================
// Log Sanitization
// ============================================================================
//
// Free text from the ERP and customer PII pass through here before they reach
// a log line.
//
// 1. Newlines and control characters are removed so one value cannot forge a
//    second log entry.
// 2. ANSI escape sequences are stripped.
// 3. Long values are truncated on a character boundary (ERP data is mostly
//    multi-byte text).
// 4. Phone numbers and e-mail addresses are masked.
//
// ============================================================================

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum number of characters kept from a logged value
const MAX_LOG_LENGTH: usize = 200;

static ANSI_ESCAPE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("valid ANSI escape pattern"));

/// Sanitize untrusted text for safe logging
///
/// # Examples:
/// ```
/// use customer_erp_sync::utils::log_sanitizer::sanitize_for_log;
///
/// assert_eq!(
///     sanitize_for_log("ACME\nINFO: Fake log entry"),
///     "ACME INFO: Fake log entry"
/// );
/// assert_eq!(sanitize_for_log("test\x1b[31mred\x1b[0m"), "testred");
///
/// let long_name = "公".repeat(300);
/// assert_eq!(sanitize_for_log(&long_name).chars().count(), 203);
/// ```
pub fn sanitize_for_log(input: &str) -> String {
    let no_ansi = ANSI_ESCAPE_REGEX.replace_all(input, "");

    let cleaned: String = no_ansi
        .chars()
        .map(|c| if matches!(c, '\n' | '\r' | '\t') { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect();

    match cleaned.char_indices().nth(MAX_LOG_LENGTH) {
        Some((cut, _)) => format!("{}...", &cleaned[..cut]),
        None => cleaned,
    }
}

/// Returns "None" if the input is None, otherwise sanitizes the value.
pub fn sanitize_option_for_log(input: &Option<String>) -> String {
    match input {
        Some(value) => sanitize_for_log(value),
        None => "None".to_string(),
    }
}

/// Mask a phone number, keeping the first three and last four digits.
///
/// ```
/// use customer_erp_sync::utils::log_sanitizer::mask_phone;
///
/// assert_eq!(mask_phone("13800001111"), "138****1111");
/// assert_eq!(mask_phone("12345"), "*****");
/// ```
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = sanitize_for_log(phone.trim()).chars().collect();
    if chars.len() < 8 {
        return "*".repeat(chars.len());
    }

    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

/// Mask the local part of an e-mail address.
///
/// ```
/// use customer_erp_sync::utils::log_sanitizer::mask_email;
///
/// assert_eq!(mask_email("zhang.wei@example.com"), "z***@example.com");
/// ```
pub fn mask_email(email: &str) -> String {
    let email = sanitize_for_log(email.trim());
    match email.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{}***@{}", first, domain)
        }
        None => "***".to_string(),
    }
}

pub fn mask_option_phone(phone: &Option<String>) -> String {
    phone.as_deref().map(mask_phone).unwrap_or_else(|| "None".to_string())
}

/// Redact values that must never be logged (passwords, session tokens)
pub fn redact_sensitive(input: &str) -> String {
    format!("[REDACTED-{}]", input.len())
}
