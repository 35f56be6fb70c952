//! Majority vote over answers gathered from several nodes.

use serde::Serialize;
use serde_json::Value;

/// Most frequent object among those whose `key` field equals `value`.
/// Objects are compared whole; ties go to the first one seen.
pub fn vote_from_responses<T>(responses: &[Vec<T>], key: &str, value: &Value) -> Option<T>
where
    T: Serialize + PartialEq + Clone,
{
    let mut tally: Vec<(&T, usize)> = Vec::new();
    for candidate in responses.iter().flatten() {
        let matches = serde_json::to_value(candidate)
            .ok()
            .is_some_and(|v| v.get(key) == Some(value));
        if !matches {
            continue;
        }
        match tally.iter_mut().find(|(seen, _)| *seen == candidate) {
            Some((_, count)) => *count += 1,
            None => tally.push((candidate, 1)),
        }
    }

    let mut best: Option<(&T, usize)> = None;
    for (candidate, count) in tally {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((candidate, count));
        }
    }
    best.map(|(candidate, _)| candidate.clone())
}
