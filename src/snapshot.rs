//! Per-message status snapshots.
//!
//! A snapshot is a nested mapping from entity name (player, NPCs) to
//! attribute values. It lives under a fixed key in the host's per-message
//! variable store, and only assistant messages may carry a non-empty one —
//! a snapshot found on a user message is "ghost data" left behind by a
//! failed or rolled-back generation and is always purged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key under which a snapshot is stored in a message's variable map.
pub const SNAPSHOT_VAR_KEY: &str = "chronicler_status";

/// Alias heads accepted in dotted paths, resolved against [`AliasNames`].
pub const USER_ALIAS: &str = "_user";
pub const CHAR_ALIAS: &str = "_char";

pub type StatusSnapshot = BTreeMap<String, StatusValue>;

/// A scalar or nested value inside a snapshot.
///
/// Untagged: JSON booleans, numbers, strings and objects map directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Map(BTreeMap<String, StatusValue>),
}

impl StatusValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            StatusValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, StatusValue>> {
        match self {
            StatusValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// The real entity names the `_user`/`_char` path aliases resolve to.
#[derive(Debug, Clone, Default)]
pub struct AliasNames {
    pub user: String,
    pub char: String,
}

impl AliasNames {
    pub fn new(user: impl Into<String>, char: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            char: char.into(),
        }
    }

    /// Map an alias head to its canonical key; non-alias heads pass through.
    pub fn canonical<'a>(&'a self, head: &'a str) -> &'a str {
        match head {
            USER_ALIAS => &self.user,
            CHAR_ALIAS => &self.char,
            other => other,
        }
    }
}

/// Resolve a dotted path (alias-aware in its first segment) to a value.
pub fn resolve_path<'a>(
    snapshot: &'a StatusSnapshot,
    path: &str,
    names: &AliasNames,
) -> Option<&'a StatusValue> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    let mut current = snapshot.get(names.canonical(head))?;
    for segment in segments {
        current = current.as_map()?.get(segment)?;
    }
    Some(current)
}

/// Mutable variant of [`resolve_path`]. Writes through an alias land on the
/// canonical key, since the alias is resolved before lookup.
pub fn resolve_path_mut<'a>(
    snapshot: &'a mut StatusSnapshot,
    path: &str,
    names: &AliasNames,
) -> Option<&'a mut StatusValue> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    let mut current = snapshot.get_mut(names.canonical(head))?;
    for segment in segments {
        current = match current {
            StatusValue::Map(m) => m.get_mut(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Read-only accessor binding a snapshot to the session's entity names.
///
/// This replaces key-level aliasing: the view resolves `_user`/`_char` to the
/// canonical entries, so there is exactly one copy of each subtree and writes
/// through [`SnapshotViewMut`] are visible under the real name.
pub struct SnapshotView<'a> {
    snapshot: &'a StatusSnapshot,
    names: &'a AliasNames,
}

impl<'a> SnapshotView<'a> {
    pub fn new(snapshot: &'a StatusSnapshot, names: &'a AliasNames) -> Self {
        Self { snapshot, names }
    }

    pub fn user_subtree(&self) -> Option<&'a BTreeMap<String, StatusValue>> {
        self.snapshot.get(&self.names.user)?.as_map()
    }

    pub fn char_subtree(&self) -> Option<&'a BTreeMap<String, StatusValue>> {
        self.snapshot.get(&self.names.char)?.as_map()
    }

    pub fn get(&self, path: &str) -> Option<&'a StatusValue> {
        resolve_path(self.snapshot, path, self.names)
    }
}

/// Mutable accessor companion to [`SnapshotView`].
pub struct SnapshotViewMut<'a> {
    snapshot: &'a mut StatusSnapshot,
    names: &'a AliasNames,
}

impl<'a> SnapshotViewMut<'a> {
    pub fn new(snapshot: &'a mut StatusSnapshot, names: &'a AliasNames) -> Self {
        Self { snapshot, names }
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut StatusValue> {
        resolve_path_mut(self.snapshot, path, self.names)
    }

    pub fn user_subtree_mut(&mut self) -> Option<&mut BTreeMap<String, StatusValue>> {
        match self.snapshot.get_mut(&self.names.user)? {
            StatusValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn char_subtree_mut(&mut self) -> Option<&mut BTreeMap<String, StatusValue>> {
        match self.snapshot.get_mut(&self.names.char)? {
            StatusValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// Merge a partial delta into a base snapshot. Nested maps merge key by key;
/// scalars replace whatever was there.
pub fn merge_delta(base: &mut StatusSnapshot, delta: &StatusSnapshot) {
    for (key, value) in delta {
        match (base.get_mut(key), value) {
            (Some(StatusValue::Map(existing)), StatusValue::Map(incoming)) => {
                merge_delta(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Extract the snapshot stored in a message's variable map, if any.
pub fn snapshot_from_variables(vars: &serde_json::Map<String, Value>) -> Option<StatusSnapshot> {
    let raw = vars.get(SNAPSHOT_VAR_KEY)?;
    serde_json::from_value(raw.clone()).ok()
}

/// Store a snapshot into a message's variable map.
pub fn snapshot_into_variables(vars: &mut serde_json::Map<String, Value>, snapshot: &StatusSnapshot) {
    if let Ok(value) = serde_json::to_value(snapshot) {
        vars.insert(SNAPSHOT_VAR_KEY.to_string(), value);
    }
}

/// Remove the snapshot key from a variable map, leaving every other variable
/// intact. Returns true when a non-empty snapshot was actually present.
pub fn strip_snapshot(vars: &mut serde_json::Map<String, Value>) -> bool {
    match vars.remove(SNAPSHOT_VAR_KEY) {
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> StatusSnapshot {
        serde_json::from_value(json!({
            "Alice": { "HP": 50.0, "mood": "calm" },
            "Bob": { "inventory": { "gold": 12.0 } }
        }))
        .unwrap()
    }

    fn names() -> AliasNames {
        AliasNames::new("Alice", "Bob")
    }

    #[test]
    fn alias_path_resolves_to_canonical_entry() {
        let snap = sample();
        let via_alias = resolve_path(&snap, "_user.HP", &names()).unwrap();
        let via_name = resolve_path(&snap, "Alice.HP", &names()).unwrap();
        assert_eq!(via_alias, via_name);
        assert_eq!(via_alias.as_number(), Some(50.0));
    }

    #[test]
    fn writes_through_alias_land_on_real_key() {
        let mut snap = sample();
        let n = names();
        *resolve_path_mut(&mut snap, "_char.inventory.gold", &n).unwrap() =
            StatusValue::Number(99.0);
        assert_eq!(
            resolve_path(&snap, "Bob.inventory.gold", &n).unwrap().as_number(),
            Some(99.0)
        );
    }

    #[test]
    fn view_exposes_both_subtrees_over_one_mapping() {
        let snap = sample();
        let n = names();
        let view = SnapshotView::new(&snap, &n);
        assert!(view.user_subtree().unwrap().contains_key("HP"));
        assert!(view.char_subtree().unwrap().contains_key("inventory"));
    }

    #[test]
    fn merge_replaces_scalars_and_merges_maps() {
        let mut base = sample();
        let delta: StatusSnapshot = serde_json::from_value(json!({
            "Alice": { "HP": 40.0 },
            "Carol": { "HP": 10.0 }
        }))
        .unwrap();
        merge_delta(&mut base, &delta);
        let n = names();
        assert_eq!(resolve_path(&base, "Alice.HP", &n).unwrap().as_number(), Some(40.0));
        // Untouched siblings survive the merge.
        assert_eq!(
            resolve_path(&base, "Alice.mood", &n).unwrap(),
            &StatusValue::Text("calm".into())
        );
        assert!(base.contains_key("Carol"));
    }

    #[test]
    fn strip_removes_only_the_snapshot_key() {
        let mut vars = serde_json::Map::new();
        vars.insert("other".into(), json!(1));
        vars.insert(SNAPSHOT_VAR_KEY.into(), json!({ "Alice": { "HP": 1.0 } }));
        assert!(strip_snapshot(&mut vars));
        assert!(vars.contains_key("other"));
        assert!(!vars.contains_key(SNAPSHOT_VAR_KEY));
        // Second strip is a no-op.
        assert!(!strip_snapshot(&mut vars));
    }
}
