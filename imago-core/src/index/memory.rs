//! In-memory `IndexStore` used by tests and by brokerless single-binary
//! deployments. Sorted sets order by `(score, member)` like Redis; TTLs
//! are accepted and ignored.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::index::store::IndexStore;

#[derive(Debug, Default)]
struct State {
    sorted: HashMap<String, HashMap<String, f64>>,
    values: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    state: Mutex<State>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ordered_members(set: &HashMap<String, f64>) -> Vec<(f64, String)> {
    let mut members: Vec<(f64, String)> = set
        .iter()
        .map(|(member, score)| (*score, member.clone()))
        .collect();
    members.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    members
}

fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Minimal glob: `*` matches any run of characters.
fn glob_match(pattern: &str, input: &str) -> bool {
    fn inner(pattern: &[u8], input: &[u8]) -> bool {
        match pattern.first() {
            None => input.is_empty(),
            Some(b'*') => {
                inner(&pattern[1..], input)
                    || (!input.is_empty() && inner(pattern, &input[1..]))
            }
            Some(byte) => {
                input.first() == Some(byte) && inner(&pattern[1..], &input[1..])
            }
        }
    }
    inner(pattern.as_bytes(), input.as_bytes())
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zadd_multi(&self, entries: &[(String, String, f64)]) -> Result<()> {
        let mut state = self.state.lock().await;
        for (key, member, score) in entries {
            state
                .sorted
                .entry(key.clone())
                .or_default()
                .insert(member.clone(), *score);
        }
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(set) = state.sorted.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn zrem_multi(&self, entries: &[(String, String)]) -> Result<()> {
        let mut state = self.state.lock().await;
        for (key, member) in entries {
            if let Some(set) = state.sorted.get_mut(key) {
                set.remove(member);
            }
        }
        Ok(())
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>> {
        let state = self.state.lock().await;
        let Some(set) = state.sorted.get(key) else {
            return Ok(None);
        };
        if !set.contains_key(member) {
            return Ok(None);
        }
        let rank = ordered_members(set)
            .iter()
            .position(|(_, m)| m == member)
            .map(|p| p as u64);
        Ok(rank)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let Some(set) = state.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let members = ordered_members(set);
        let Some((start, stop)) = normalize_range(members.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(members[start..=stop]
            .iter()
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.sorted.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock().await;
        Ok(state.values.get(key).cloned())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let state = self.state.lock().await;
        Ok(keys.iter().map(|key| state.values.get(key).cloned()).collect())
    }

    async fn mset(&self, pairs: &[(String, Vec<u8>)]) -> Result<()> {
        let mut state = self.state.lock().await;
        for (key, value) in pairs {
            state.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, _ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        for key in keys {
            state.values.remove(key);
            state.sorted.remove(key);
        }
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut keys: Vec<String> = state
            .values
            .keys()
            .chain(state.sorted.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zrange_and_zrank_follow_score_then_member_order() {
        let store = MemoryIndexStore::new();
        store.zadd("k", "b", 2.0).await.unwrap();
        store.zadd("k", "a", 1.0).await.unwrap();
        store.zadd("k", "c", 2.0).await.unwrap();

        assert_eq!(store.zrange("k", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.zrank("k", "c").await.unwrap(), Some(2));
        assert_eq!(store.zrank("k", "missing").await.unwrap(), None);
        assert_eq!(store.zcard("k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn negative_scores_sort_before_positive() {
        let store = MemoryIndexStore::new();
        store.zadd("k", "new", -200.0).await.unwrap();
        store.zadd("k", "old", -100.0).await.unwrap();
        assert_eq!(store.zrange("k", 0, 0).await.unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn out_of_range_requests_are_empty() {
        let store = MemoryIndexStore::new();
        store.zadd("k", "a", 1.0).await.unwrap();
        assert!(store.zrange("k", 5, 9).await.unwrap().is_empty());
        assert!(store.zrange("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_matches_globs() {
        let store = MemoryIndexStore::new();
        store.mset(&[
            ("idx:state:1".into(), vec![1]),
            ("idx:state:2".into(), vec![2]),
            ("idx:data:1".into(), vec![3]),
            ("other".into(), vec![4]),
        ])
        .await
        .unwrap();

        let keys = store.scan_keys("idx:state:*").await.unwrap();
        assert_eq!(keys, vec!["idx:state:1", "idx:state:2"]);
        let all = store.scan_keys("idx:*").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn glob_edge_cases() {
        assert!(glob_match("idx:*", "idx:data:x"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exact-not"));
        assert!(glob_match("a*b*c", "a-x-b-y-c"));
        assert!(!glob_match("a*b*c", "a-x-c"));
        assert!(glob_match("a*b", "a-b-b"));
    }
}
