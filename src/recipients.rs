//! Recipient normalization.
//!
//! Turns raw candidate strings (an uploaded contact list, a pasted list) into
//! canonical [`Recipient`]s. Malformed entries are dropped, never reported as
//! errors; what to do with an empty result is the caller's decision.

use crate::config::{env_parse, env_string};
use crate::types::Recipient;

/// Request-shaped validation failures returned to the caller of a control
/// operation. Individual malformed recipients are not errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("No valid recipients in request")]
    NoRecipients,

    #[error("Too many recipients: {count} (max {max})")]
    TooManyRecipients { count: usize, max: usize },

    #[error("Message has no text and no media")]
    EmptyPayload,

    #[error("Delay of {requested}s exceeds the maximum of {max}s")]
    DelayTooLong { requested: u64, max: u64 },
}

/// Shortest and longest canonical number accepted
pub const MIN_DIGITS: usize = 10;
pub const MAX_DIGITS: usize = 13;

/// Digit lengths treated as a local number missing its country prefix
const LOCAL_LENGTHS: std::ops::RangeInclusive<usize> = 10..=11;

/// Normalization rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientPolicy {
    /// Prepended to local numbers
    pub country_prefix: String,
    pub min_digits: usize,
    pub max_digits: usize,
}

impl Default for RecipientPolicy {
    fn default() -> Self {
        Self {
            country_prefix: "55".to_string(),
            min_digits: MIN_DIGITS,
            max_digits: MAX_DIGITS,
        }
    }
}

impl RecipientPolicy {
    /// Load policy from environment variables.
    ///
    /// Bounds are clamped to 10..=13 digits. A prefix that would push an
    /// 11 digit local number past `max_digits` is ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let min_digits = env_parse("RECIPIENT_MIN_DIGITS", defaults.min_digits);
        let max_digits = env_parse("RECIPIENT_MAX_DIGITS", defaults.max_digits);
        let min_digits = min_digits.clamp(MIN_DIGITS, MAX_DIGITS);
        let max_digits = max_digits.clamp(min_digits, MAX_DIGITS);

        let country_prefix = match env_string("DEFAULT_COUNTRY_CODE")
            .map(|raw| raw.chars().filter(|c| c.is_ascii_digit()).collect::<String>())
            .filter(|digits| !digits.is_empty())
        {
            Some(prefix) if prefix.len() + LOCAL_LENGTHS.end() > max_digits => {
                tracing::warn!(
                    "Ignoring DEFAULT_COUNTRY_CODE={}: local numbers would exceed {} digits",
                    prefix,
                    max_digits
                );
                defaults.country_prefix
            }
            Some(prefix) => prefix,
            None => defaults.country_prefix,
        };

        Self {
            country_prefix,
            min_digits,
            max_digits,
        }
    }

    fn accepts(&self, len: usize) -> bool {
        (self.min_digits..=self.max_digits).contains(&len)
            && (MIN_DIGITS..=MAX_DIGITS).contains(&len)
    }
}

/// Result of validating a batch, with the count of dropped candidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub recipients: Vec<Recipient>,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RecipientValidator {
    policy: RecipientPolicy,
}

impl RecipientValidator {
    pub fn new(policy: RecipientPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RecipientPolicy {
        &self.policy
    }

    /// Normalize candidates, preserving order and duplicates
    pub fn validate<S: AsRef<str>>(&self, raw: &[S]) -> Vec<Recipient> {
        self.validate_report(raw).recipients
    }

    pub fn validate_report<S: AsRef<str>>(&self, raw: &[S]) -> ValidationReport {
        let recipients: Vec<Recipient> = raw
            .iter()
            .filter_map(|candidate| self.normalize(candidate.as_ref()))
            .collect();
        let dropped = raw.len() - recipients.len();
        if dropped > 0 {
            tracing::debug!("Dropped {} malformed recipient(s)", dropped);
        }
        ValidationReport {
            recipients,
            dropped,
        }
    }

    /// Normalize a single candidate, or `None` if it is malformed.
    ///
    /// 10 and 11 digit numbers are local and always get the country prefix,
    /// even when their area code happens to match it.
    pub fn normalize(&self, candidate: &str) -> Option<Recipient> {
        let digits: String = candidate.chars().filter(|c| c.is_ascii_digit()).collect();
        if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
            return None;
        }

        let canonical = if LOCAL_LENGTHS.contains(&digits.len()) {
            format!("{}{}", self.policy.country_prefix, digits)
        } else {
            digits
        };
        if !self.policy.accepts(canonical.len()) {
            return None;
        }

        Some(Recipient::from_digits(canonical))
    }
}

/// Split free text into raw candidates on newlines, commas and semicolons
pub fn parse_contact_list(text: &str) -> Vec<String> {
    text.split(['\n', '\r', ',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn digits(r: &[Recipient]) -> Vec<&str> {
        r.iter().map(Recipient::as_str).collect()
    }

    #[test]
    fn test_formatted_local_number_gets_prefix() {
        let v = RecipientValidator::default();
        let out = v.validate(&["(11) 98888-7777"]);
        assert_eq!(digits(&out), vec!["5511988887777"]);
    }

    #[test]
    fn test_short_and_long_numbers_are_dropped() {
        let v = RecipientValidator::default();
        let report = v.validate_report(&["123", "", "abc", "55119999900001234"]);
        assert!(report.recipients.is_empty());
        assert_eq!(report.dropped, 4);
    }

    #[test]
    fn test_ten_digit_landline_gets_prefix() {
        let v = RecipientValidator::default();
        assert_eq!(
            v.normalize("11 3333-4444").unwrap().as_str(),
            "551133334444"
        );
    }

    #[test]
    fn test_already_prefixed_numbers_are_kept() {
        let v = RecipientValidator::default();
        let out = v.validate(&["+55 11 99999-0000", "551133334444"]);
        assert_eq!(digits(&out), vec!["5511999990000", "551133334444"]);
    }

    #[test]
    fn test_order_and_duplicates_are_preserved() {
        let v = RecipientValidator::default();
        let out = v.validate(&["5511999990001", "bad", "5511999990000", "5511999990001"]);
        assert_eq!(
            digits(&out),
            vec!["5511999990001", "5511999990000", "5511999990001"]
        );
    }

    #[test]
    fn test_every_output_is_within_bounds() {
        let v = RecipientValidator::default();
        let inputs = [
            "1", "12345678901234", "(21) 2222-3333", "021 2222 3333", "4915112345678",
            "+1 (415) 555-0100", "11988887777", "5511988887777", "999999999",
        ];
        for r in v.validate(&inputs) {
            let len = r.as_str().len();
            assert!((10..=13).contains(&len), "{} out of range", r);
            assert!(r.as_str().chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_custom_country_prefix() {
        let v = RecipientValidator::new(RecipientPolicy {
            country_prefix: "49".to_string(),
            ..RecipientPolicy::default()
        });
        assert_eq!(v.normalize("0151 1234567").unwrap().as_str(), "4901511234567");
    }

    #[test]
    fn test_area_code_matching_prefix_is_still_local() {
        let v = RecipientValidator::default();
        assert_eq!(
            v.normalize("(55) 99999-0000").unwrap().as_str(),
            "5555999990000"
        );
    }

    #[test]
    fn test_long_prefix_drops_numbers_past_max() {
        let v = RecipientValidator::new(RecipientPolicy {
            country_prefix: "351".to_string(),
            ..RecipientPolicy::default()
        });
        assert!(v.normalize("91 234-567-890").is_none());
        assert_eq!(v.normalize("912 345 678 0").unwrap().as_str(), "3519123456780");
    }

    #[test]
    fn test_narrower_max_digits_applies_after_prefix() {
        let v = RecipientValidator::new(RecipientPolicy {
            max_digits: 12,
            ..RecipientPolicy::default()
        });
        let report = v.validate_report(&["(11) 98888-7777", "11 3333-4444", "5511999990000"]);
        assert_eq!(digits(&report.recipients), vec!["551133334444"]);
        assert_eq!(report.dropped, 2);
    }

    fn clear_env() {
        for key in ["DEFAULT_COUNTRY_CODE", "RECIPIENT_MIN_DIGITS", "RECIPIENT_MAX_DIGITS"] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_policy_from_env() {
        clear_env();
        assert_eq!(RecipientPolicy::from_env(), RecipientPolicy::default());

        std::env::set_var("DEFAULT_COUNTRY_CODE", "+49");
        std::env::set_var("RECIPIENT_MIN_DIGITS", "12");
        let policy = RecipientPolicy::from_env();
        assert_eq!(policy.country_prefix, "49");
        assert_eq!((policy.min_digits, policy.max_digits), (12, 13));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_policy_from_env_clamps_bounds_and_prefix() {
        clear_env();
        std::env::set_var("RECIPIENT_MIN_DIGITS", "4");
        std::env::set_var("RECIPIENT_MAX_DIGITS", "20");
        std::env::set_var("DEFAULT_COUNTRY_CODE", "351");
        let policy = RecipientPolicy::from_env();
        assert_eq!((policy.min_digits, policy.max_digits), (10, 13));
        assert_eq!(policy.country_prefix, "55");
        clear_env();
    }

    #[test]
    fn test_parse_contact_list() {
        let text = "5511999990000\r\n(11) 98888-7777, 11977776666;\n\n  ";
        assert_eq!(
            parse_contact_list(text),
            vec!["5511999990000", "(11) 98888-7777", "11977776666"]
        );
    }
}
