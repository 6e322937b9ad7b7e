//! Query-parameter validation and `max_id`/`since_id` pagination
//!
//! Cursors operate on item ids (upstream ids for forwarded timelines, post
//! keys for the recommended timeline). Responses carry a `Link` header with
//! `next`/`prev` targets only when more content exists in that direction.

use crate::error::{Error, Result};

/// Default page size when the caller omits `limit`
pub const DEFAULT_LIMIT: usize = 20;

/// Upper bound on `limit`
pub const MAX_LIMIT: usize = 100;

/// Validate `limit`. `0` is a legal request for an empty page; values above
/// [`MAX_LIMIT`] are a validation error.
pub fn validate_limit(limit: Option<i64>) -> Result<usize> {
    match limit {
        None => Ok(DEFAULT_LIMIT),
        Some(v) if v < 0 => Err(Error::validation("limit", "must be non-negative")),
        Some(v) if v as usize > MAX_LIMIT => {
            Err(Error::validation("limit", "must be at most 100"))
        }
        Some(v) => Ok(v as usize),
    }
}

/// Validate `min_score` into [0.0, 1.0]
pub fn validate_min_score(min_score: Option<f64>) -> Result<f64> {
    match min_score {
        None => Ok(0.0),
        Some(v) if !(0.0..=1.0).contains(&v) || v.is_nan() => {
            Err(Error::validation("min_score", "must be within [0.0, 1.0]"))
        }
        Some(v) => Ok(v),
    }
}

/// Split a comma-separated `languages` parameter into trimmed, lowercased
/// tags; `None` or an empty string mean no filter.
pub fn parse_languages(raw: Option<&str>) -> Option<Vec<String>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    let tags: Vec<String> = raw
        .split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    if tags.is_empty() {
        None
    } else {
        Some(tags)
    }
}

/// One page cut out of an ordered item list
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// The items on this page, in the input order
    pub items: Vec<T>,
    /// Whether older items remain past the end of this page
    pub has_next: bool,
    /// Whether newer items exist before the start of this page
    pub has_prev: bool,
}

/// Cut a `max_id`/`since_id` page out of `items`, which must already be in
/// presentation order (newest or highest-ranked first). Cursors are matched
/// positionally: `max_id` starts the page just after that item, `since_id`
/// ends it just before.
pub fn paginate<T, F>(items: &[T], id_of: F, max_id: Option<&str>, since_id: Option<&str>, limit: usize) -> Page<T>
where
    T: Clone,
    F: Fn(&T) -> String,
{
    let start = match max_id {
        Some(id) => items
            .iter()
            .position(|item| id_of(item) == id)
            .map(|i| i + 1)
            .unwrap_or(0),
        None => 0,
    };
    let end = match since_id {
        Some(id) => items
            .iter()
            .position(|item| id_of(item) == id)
            .unwrap_or(items.len()),
        None => items.len(),
    };
    let end = end.max(start);

    let window = &items[start..end];
    let page: Vec<T> = window.iter().take(limit).cloned().collect();

    Page {
        has_next: window.len() > page.len() || end < items.len(),
        has_prev: start > 0,
        items: page,
    }
}

/// Build a `Link` header for a page. Returns `None` when neither direction
/// has more content, so small pages carry no header at all.
pub fn link_header(
    base_path: &str,
    limit: usize,
    page_first_id: Option<&str>,
    page_last_id: Option<&str>,
    has_next: bool,
    has_prev: bool,
) -> Option<String> {
    let mut parts = Vec::new();
    if has_next {
        if let Some(last) = page_last_id {
            parts.push(format!(
                "<{}?limit={}&max_id={}>; rel=\"next\"",
                base_path, limit, last
            ));
        }
    }
    if has_prev {
        if let Some(first) = page_first_id {
            parts.push(format!(
                "<{}?limit={}&since_id={}>; rel=\"prev\"",
                base_path, limit, first
            ));
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_bounds() {
        assert_eq!(validate_limit(None).unwrap(), DEFAULT_LIMIT);
        assert_eq!(validate_limit(Some(0)).unwrap(), 0);
        assert_eq!(validate_limit(Some(100)).unwrap(), 100);
        assert!(validate_limit(Some(101)).is_err());
        assert!(validate_limit(Some(-1)).is_err());
    }

    #[test]
    fn min_score_bounds() {
        assert_eq!(validate_min_score(None).unwrap(), 0.0);
        assert_eq!(validate_min_score(Some(0.5)).unwrap(), 0.5);
        assert!(validate_min_score(Some(1.5)).is_err());
        assert!(validate_min_score(Some(-0.1)).is_err());
        assert!(validate_min_score(Some(f64::NAN)).is_err());
    }

    #[test]
    fn languages_parsing() {
        assert_eq!(parse_languages(None), None);
        assert_eq!(parse_languages(Some("")), None);
        assert_eq!(
            parse_languages(Some("es, EN ,pt")),
            Some(vec!["es".to_string(), "en".to_string(), "pt".to_string()])
        );
    }

    #[test]
    fn pagination_windows() {
        let items: Vec<String> = (1..=5).map(|i| format!("p{i}")).collect();
        let id = |s: &String| s.clone();

        let page = paginate(&items, id, None, None, 2);
        assert_eq!(page.items, vec!["p1", "p2"]);
        assert!(page.has_next);
        assert!(!page.has_prev);

        let page = paginate(&items, id, Some("p2"), None, 2);
        assert_eq!(page.items, vec!["p3", "p4"]);
        assert!(page.has_next);
        assert!(page.has_prev);

        let page = paginate(&items, id, None, Some("p4"), 10);
        assert_eq!(page.items, vec!["p1", "p2", "p3"]);
        assert!(page.has_next);

        // Unknown cursor falls back to the top of the list.
        let page = paginate(&items, id, Some("unknown"), None, 10);
        assert_eq!(page.items.len(), 5);
    }

    #[test]
    fn link_header_only_when_more_exists() {
        assert_eq!(link_header("/t", 20, Some("a"), Some("b"), false, false), None);

        let header = link_header("/t", 20, Some("a"), Some("b"), true, false).unwrap();
        assert!(header.contains("rel=\"next\""));
        assert!(header.contains("max_id=b"));
        assert!(!header.contains("rel=\"prev\""));

        let header = link_header("/t", 20, Some("a"), Some("b"), true, true).unwrap();
        assert!(header.contains("rel=\"prev\""));
        assert!(header.contains("since_id=a"));
    }
}
