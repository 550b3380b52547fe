//! Subdomain format validation

/// Whether `name` is a well-formed tunnel subdomain: non-empty, lowercase
/// ASCII letters, digits and hyphens only.
pub fn is_valid(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_subdomains() {
        assert!(is_valid("brave-fox-abcd"));
        assert!(is_valid("myapp"));
        assert!(is_valid("a-1"));
        assert!(is_valid("0"));
    }

    #[test]
    fn test_invalid_subdomains() {
        assert!(!is_valid(""));
        assert!(!is_valid("MyApp"));
        assert!(!is_valid("my_app"));
        assert!(!is_valid("my.app"));
        assert!(!is_valid("app!"));
        assert!(!is_valid("héllo"));
    }
}
