//! Static access-token checks for framework connections.

/// Decide whether an upgrade request may proceed.
///
/// * `expected` - Configured token; `None` disables the check.
/// * `authorization` - Raw `Authorization` header value, if any. Only an
///   exact `Bearer <token>` is accepted.
pub fn is_authorized(expected: Option<&str>, authorization: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    authorization.and_then(|h| h.strip_prefix("Bearer ")) == Some(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_when_unconfigured() {
        assert!(is_authorized(None, None));
        assert!(is_authorized(None, Some("Bearer whatever")));
    }

    #[test]
    fn bearer_must_match_exactly() {
        let token = Some("s3cret");
        assert!(is_authorized(token, Some("Bearer s3cret")));
        assert!(!is_authorized(token, None));
        assert!(!is_authorized(token, Some("Bearer wrong")));
        assert!(!is_authorized(token, Some("bearer s3cret")));
        assert!(!is_authorized(token, Some("Bearer s3cret ")));
        assert!(!is_authorized(token, Some("s3cret")));
    }
}
