//! Property tests for subject patterns.

use light_link::subject::validate_subject;
use light_link::Pattern;
use proptest::prelude::*;

fn token() -> impl Strategy<Value = String> {
    "[a-z0-9_$-]{1,6}"
}

fn subject() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(token(), 1..6)
}

proptest! {
    #[test]
    fn literal_pattern_matches_only_itself(tokens in subject(), other in subject()) {
        let raw = tokens.join(".");
        let pattern = Pattern::parse(&raw).unwrap();
        prop_assert!(pattern.is_literal());
        prop_assert!(pattern.matches(&raw));
        prop_assert_eq!(pattern.matches(&other.join(".")), other == tokens);
    }

    #[test]
    fn single_wildcard_replaces_exactly_one_token(tokens in subject(), index in any::<prop::sample::Index>()) {
        let at = index.index(tokens.len());
        let mut parts: Vec<&str> = tokens.iter().map(String::as_str).collect();
        parts[at] = "*";
        let pattern = Pattern::parse(&parts.join(".")).unwrap();

        prop_assert!(pattern.matches(&tokens.join(".")));
        let longer = format!("{}.extra", tokens.join("."));
        prop_assert!(!pattern.matches(&longer));
    }

    #[test]
    fn tail_wildcard_needs_at_least_one_token(prefix in subject(), rest in subject()) {
        let pattern = Pattern::parse(&format!("{}.>", prefix.join("."))).unwrap();

        prop_assert!(!pattern.matches(&prefix.join(".")));
        let full = format!("{}.{}", prefix.join("."), rest.join("."));
        prop_assert!(pattern.matches(&full));
    }

    #[test]
    fn publishable_subjects_are_valid_patterns(tokens in subject()) {
        let raw = tokens.join(".");
        prop_assert!(validate_subject(&raw).is_ok());
        prop_assert!(Pattern::parse(&raw).is_ok());
    }

    #[test]
    fn empty_tokens_are_rejected(tokens in subject(), index in any::<prop::sample::Index>()) {
        let mut parts = tokens.clone();
        parts.insert(index.index(parts.len() + 1), String::new());
        let raw = parts.join(".");
        prop_assert!(validate_subject(&raw).is_err());
        prop_assert!(Pattern::parse(&raw).is_err());
    }
}
