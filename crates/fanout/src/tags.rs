//! Tag filter semantics for subscriber deliveries. A stored tag satisfies a
//! requested tag when it is equal, or when it is the requested tag with a
//! `-<digits>` suffix (`retract-1` satisfies `retract`). With several
//! requested tags, every one must be satisfied, and only the matched
//! stored tags are returned.

/// Whether one stored tag satisfies one requested tag.
pub fn tag_matches(stored: &str, requested: &str) -> bool {
    if stored == requested {
        return true;
    }
    match stored.strip_prefix(requested) {
        Some(rest) => {
            let mut chars = rest.chars();
            chars.next() == Some('-') && {
                let digits = chars.as_str();
                !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
            }
        }
        None => false,
    }
}

/// Apply a tag query. None when some requested tag matched nothing; the
/// matched subset of stored tags (order preserved) otherwise. An empty
/// request matches everything and returns all stored tags.
pub fn filter_tags(stored: &[String], requested: &[String]) -> Option<Vec<String>> {
    if requested.is_empty() {
        return Some(stored.to_vec());
    }
    for wanted in requested {
        if !stored.iter().any(|tag| tag_matches(tag, wanted)) {
            return None;
        }
    }
    Some(
        stored
            .iter()
            .filter(|tag| requested.iter().any(|wanted| tag_matches(tag, wanted)))
            .cloned()
            .collect(),
    )
}

/// Tags a watch explicitly requests, carried as a `tags=` query on its
/// path. Requesting `retract` is how a subscriber opts in to retractions.
pub fn requested_tags(path: &str) -> Vec<String> {
    let Some((_, query)) = path.split_once('?') else {
        return Vec::new();
    };
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("tags=") {
            return value
                .split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    Vec::new()
}

#[cfg(test)]
mod test {
    use super::*;

    fn strings(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|tag| tag.to_string()).collect()
    }

    #[test]
    fn test_tag_matches_exact_and_suffixed() {
        assert!(tag_matches("retract", "retract"));
        assert!(tag_matches("retract-1", "retract"));
        assert!(tag_matches("retract-12", "retract"));
        assert!(!tag_matches("retraction", "retract"));
        assert!(!tag_matches("retract-", "retract"));
        assert!(!tag_matches("retract-1a", "retract"));
        assert!(!tag_matches("retract", "retract-1"));
    }

    #[test]
    fn test_single_tag_query() {
        let stored = strings(&["retract", "retract-1"]);
        assert_eq!(
            filter_tags(&stored, &strings(&["retract"])),
            Some(strings(&["retract", "retract-1"]))
        );
        assert_eq!(filter_tags(&stored, &strings(&["other"])), None);
    }

    #[test]
    fn test_multi_tag_query_requires_all() {
        let stored = strings(&["retract-1", "maintenance", "emergency"]);
        // Both requested tags match, and only their matches come back.
        assert_eq!(
            filter_tags(&stored, &strings(&["retract", "emergency"])),
            Some(strings(&["retract-1", "emergency"]))
        );
        // One requested tag unmatched fails the whole query.
        assert_eq!(
            filter_tags(&stored, &strings(&["retract", "missing"])),
            None
        );
    }

    #[test]
    fn test_empty_query_returns_everything() {
        let stored = strings(&["a", "b"]);
        assert_eq!(filter_tags(&stored, &[]), Some(stored.clone()));
    }

    #[test]
    fn test_requested_tags_from_watch_path() {
        assert_eq!(requested_tags(""), Vec::<String>::new());
        assert_eq!(requested_tags("/api/v1/pnp/notifications"), Vec::<String>::new());
        assert_eq!(
            requested_tags("/api/v1/pnp/notifications?tags=retract"),
            strings(&["retract"])
        );
        assert_eq!(
            requested_tags("/x?offset=2&tags=a, b"),
            strings(&["a", "b"])
        );
    }
}
