//! Timeline injection engine
//!
//! Merges ranked recommendations into a forwarded upstream page. The merge
//! is a pure function of its inputs: upstream posts keep their relative
//! order, injections are bounded and marked, and identical inputs produce
//! byte-identical output. Cursors never point at a recommendation; callers
//! build `Link` headers from upstream ids only.

use serde_json::Value;
use std::collections::HashSet;

/// Placement strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionStrategy {
    /// Even spacing with a deterministic offset
    Uniform,
    /// Prepend before the upstream page
    Top,
    /// Prefer positions adjacent to upstream posts sharing a tag
    TagMatch,
}

impl InjectionStrategy {
    /// Parse a strategy name; unknown names fall back to `uniform`
    pub fn parse(raw: &str) -> Self {
        match raw {
            "top" => Self::Top,
            "tag_match" => Self::TagMatch,
            "uniform" => Self::Uniform,
            other => {
                tracing::debug!(strategy = other, "unknown injection strategy; using uniform");
                Self::Uniform
            }
        }
    }
}

/// Merge `injection_set` into `upstream_page`.
///
/// At most `max_injections` recommendations are placed; under `uniform`
/// at least `gap` upstream posts separate two injections while upstream
/// posts remain. Recommendations whose id or uri already appears upstream
/// are dropped before placement.
pub fn inject(
    upstream_page: &[Value],
    injection_set: &[Value],
    strategy: InjectionStrategy,
    max_injections: usize,
    gap: usize,
) -> Vec<Value> {
    let upstream_ids: HashSet<&str> = upstream_page
        .iter()
        .flat_map(|p| {
            [
                p.get("id").and_then(Value::as_str),
                p.get("uri").and_then(Value::as_str),
            ]
        })
        .flatten()
        .collect();

    let injections: Vec<Value> = injection_set
        .iter()
        .filter(|rec| {
            let id = rec.get("id").and_then(Value::as_str);
            let uri = rec.get("uri").and_then(Value::as_str);
            !id.is_some_and(|v| upstream_ids.contains(v))
                && !uri.is_some_and(|v| upstream_ids.contains(v))
        })
        .take(max_injections)
        .cloned()
        .map(mark_recommendation)
        .collect();

    if injections.is_empty() {
        return upstream_page.to_vec();
    }

    match strategy {
        InjectionStrategy::Top => {
            let mut merged = injections;
            merged.extend(upstream_page.iter().cloned());
            merged
        }
        InjectionStrategy::Uniform => place_uniform(upstream_page, injections, gap),
        InjectionStrategy::TagMatch => place_tag_match(upstream_page, injections, gap),
    }
}

/// First and last upstream (non-recommendation) ids of a merged page, for
/// cursor construction
pub fn upstream_cursor_ids(page: &[Value]) -> (Option<String>, Option<String>) {
    let mut upstream = page.iter().filter(|p| !is_recommendation(p));
    let first = upstream
        .next()
        .and_then(|p| p.get("id").and_then(Value::as_str))
        .map(str::to_string);
    let last = page
        .iter()
        .rev()
        .find(|p| !is_recommendation(p))
        .and_then(|p| p.get("id").and_then(Value::as_str))
        .map(str::to_string);
    (first, last)
}

/// Whether a page item is an injected recommendation
pub fn is_recommendation(item: &Value) -> bool {
    item.get("is_recommendation")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn mark_recommendation(mut rec: Value) -> Value {
    if let Some(map) = rec.as_object_mut() {
        map.insert("is_recommendation".to_string(), Value::Bool(true));
    }
    rec
}

fn place_uniform(upstream: &[Value], mut injections: Vec<Value>, gap: usize) -> Vec<Value> {
    let gap = gap.max(1);
    let mut merged = Vec::with_capacity(upstream.len() + injections.len());
    let mut since_last = 0usize;

    for post in upstream {
        merged.push(post.clone());
        since_last += 1;
        if since_last >= gap && !injections.is_empty() {
            merged.push(injections.remove(0));
            since_last = 0;
        }
    }
    // Upstream exhausted; remaining injections trail the page.
    merged.append(&mut injections);
    merged
}

fn place_tag_match(upstream: &[Value], injections: Vec<Value>, gap: usize) -> Vec<Value> {
    // Assign each injection to the first upstream post sharing a tag.
    let upstream_tags: Vec<HashSet<String>> = upstream.iter().map(tags_of).collect();

    let mut assigned: Vec<Vec<Value>> = vec![Vec::new(); upstream.len()];
    let mut unmatched: Vec<Value> = Vec::new();

    for rec in injections {
        let rec_tags = tags_of(&rec);
        let position = upstream_tags
            .iter()
            .position(|tags| !tags.is_disjoint(&rec_tags));
        match position {
            Some(index) => assigned[index].push(rec),
            None => unmatched.push(rec),
        }
    }

    let mut merged = Vec::with_capacity(upstream.len() + assigned.len());
    for (index, post) in upstream.iter().enumerate() {
        merged.push(post.clone());
        merged.append(&mut assigned[index]);
    }

    if unmatched.is_empty() {
        merged
    } else {
        // Tagless leftovers fall back to uniform spacing over the merged page.
        place_uniform(&merged, unmatched, gap)
    }
}

fn tags_of(item: &Value) -> HashSet<String> {
    item.get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .map(|t| t.to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upstream(id: &str) -> Value {
        json!({ "id": id, "content": format!("<p>{id}</p>") })
    }

    fn upstream_tagged(id: &str, tags: &[&str]) -> Value {
        json!({
            "id": id,
            "tags": tags.iter().map(|t| json!({"name": t})).collect::<Vec<_>>(),
        })
    }

    fn rec(id: &str) -> Value {
        json!({
            "id": id,
            "is_recommendation": true,
            "reason_category": "trending",
            "score": 0.8,
        })
    }

    #[test]
    fn uniform_matches_the_documented_merge_order() {
        // Three upstream posts, two recommendations, gap of two.
        let page = [upstream("U1"), upstream("U2"), upstream("U3")];
        let recs = [rec("R1"), rec("R2")];

        let merged = inject(&page, &recs, InjectionStrategy::Uniform, 2, 2);

        let ids: Vec<&str> = merged.iter().map(|p| p["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["U1", "U2", "R1", "U3", "R2"]);
        assert!(merged
            .iter()
            .filter(|p| is_recommendation(p))
            .all(|p| p["is_recommendation"] == json!(true)));
    }

    #[test]
    fn upstream_order_is_preserved() {
        let page: Vec<Value> = (1..=6).map(|i| upstream(&format!("U{i}"))).collect();
        let recs: Vec<Value> = (1..=3).map(|i| rec(&format!("R{i}"))).collect();

        let merged = inject(&page, &recs, InjectionStrategy::Uniform, 3, 2);
        let upstream_ids: Vec<&str> = merged
            .iter()
            .filter(|p| !is_recommendation(p))
            .map(|p| p["id"].as_str().unwrap())
            .collect();
        assert_eq!(upstream_ids, vec!["U1", "U2", "U3", "U4", "U5", "U6"]);
    }

    #[test]
    fn bounded_injection_and_gap() {
        let page: Vec<Value> = (1..=10).map(|i| upstream(&format!("U{i}"))).collect();
        let recs: Vec<Value> = (1..=8).map(|i| rec(&format!("R{i}"))).collect();

        let merged = inject(&page, &recs, InjectionStrategy::Uniform, 3, 2);
        assert_eq!(merged.iter().filter(|p| is_recommendation(p)).count(), 3);

        // At least two upstream posts between consecutive injections.
        let mut gap_count = 0;
        for item in &merged {
            if is_recommendation(item) {
                assert!(gap_count >= 2, "gap violated");
                gap_count = 0;
            } else {
                gap_count += 1;
            }
        }
    }

    #[test]
    fn injection_is_deterministic() {
        let page: Vec<Value> = (1..=5).map(|i| upstream(&format!("U{i}"))).collect();
        let recs: Vec<Value> = (1..=2).map(|i| rec(&format!("R{i}"))).collect();

        let a = inject(&page, &recs, InjectionStrategy::Uniform, 2, 2);
        let b = inject(&page, &recs, InjectionStrategy::Uniform, 2, 2);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn top_strategy_prepends() {
        let page = [upstream("U1"), upstream("U2")];
        let recs = [rec("R1"), rec("R2")];
        let merged = inject(&page, &recs, InjectionStrategy::Top, 2, 2);
        let ids: Vec<&str> = merged.iter().map(|p| p["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["R1", "R2", "U1", "U2"]);
    }

    #[test]
    fn duplicates_are_dropped_before_placement() {
        let page = [upstream("U1"), upstream("shared")];
        let recs = [rec("shared"), rec("R2")];
        let merged = inject(&page, &recs, InjectionStrategy::Uniform, 2, 1);
        let injected: Vec<&str> = merged
            .iter()
            .filter(|p| is_recommendation(p))
            .map(|p| p["id"].as_str().unwrap())
            .collect();
        assert_eq!(injected, vec!["R2"]);
    }

    #[test]
    fn tag_match_places_adjacent_to_shared_tags() {
        let page = [
            upstream_tagged("U1", &["cooking"]),
            upstream_tagged("U2", &["rust"]),
            upstream_tagged("U3", &["hiking"]),
        ];
        let mut recommendation = rec("R1");
        recommendation["tags"] = json!([{"name": "rust"}]);

        let merged = inject(
            &page,
            &[recommendation],
            InjectionStrategy::TagMatch,
            2,
            2,
        );
        let ids: Vec<&str> = merged.iter().map(|p| p["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["U1", "U2", "R1", "U3"]);
    }

    #[test]
    fn unknown_strategy_parses_to_uniform() {
        assert_eq!(InjectionStrategy::parse("nope"), InjectionStrategy::Uniform);
        assert_eq!(InjectionStrategy::parse("top"), InjectionStrategy::Top);
        assert_eq!(
            InjectionStrategy::parse("tag_match"),
            InjectionStrategy::TagMatch
        );
    }

    #[test]
    fn empty_upstream_page_yields_injections_only() {
        let recs = [rec("R1"), rec("R2")];
        let merged = inject(&[], &recs, InjectionStrategy::Uniform, 2, 2);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(is_recommendation));
    }

    #[test]
    fn cursors_skip_recommendations() {
        let page = [upstream("U1"), rec("R1"), upstream("U2"), rec("R2")];
        let (first, last) = upstream_cursor_ids(&page);
        assert_eq!(first.as_deref(), Some("U1"));
        assert_eq!(last.as_deref(), Some("U2"));

        let only_recs = [rec("R1")];
        let (first, last) = upstream_cursor_ids(&only_recs);
        assert_eq!(first, None);
        assert_eq!(last, None);
    }
}
