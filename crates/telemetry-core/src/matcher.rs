//! Structural matching of match-descriptor trees against nested data.
//!
//! A match-descriptor is a JSON object whose keys are literal names or
//! regular expressions. Object values descend one level; any other value is
//! a terminal marker. Matching compares *shape* only: the leaf values of the
//! descriptor are never compared with the data here.
//!
//! Every primitive is generic over [`MatchTree`] so the same code drives the
//! stats [`Skeleton`](crate::filter::Skeleton) and real collected JSON.

use serde_json::{Map, Value};

use crate::pattern;

/// A tree the matcher can walk and prune.
pub trait MatchTree {
    /// Child keys in iteration order. Leaves have none.
    fn child_keys(&self) -> Vec<String>;

    fn has_child(&self, key: &str) -> bool;

    fn child(&self, key: &str) -> Option<&Self>;

    fn child_mut(&mut self, key: &str) -> Option<&mut Self>;

    fn remove_child(&mut self, key: &str);

    /// Whether this node can hold children.
    fn is_branch(&self) -> bool;
}

impl MatchTree for Value {
    fn child_keys(&self) -> Vec<String> {
        match self {
            Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn has_child(&self, key: &str) -> bool {
        self.as_object().is_some_and(|map| map.contains_key(key))
    }

    fn child(&self, key: &str) -> Option<&Self> {
        self.as_object()?.get(key)
    }

    fn child_mut(&mut self, key: &str) -> Option<&mut Self> {
        self.as_object_mut()?.get_mut(key)
    }

    fn remove_child(&mut self, key: &str) {
        if let Value::Object(map) = self {
            map.retain(|k, _| k != key);
        }
    }

    fn is_branch(&self) -> bool {
        self.is_object()
    }
}

/// A terminal match found by [`get_deep_matches`]: `key` under the object
/// reached by following `path` from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeepMatch {
    pub path: Vec<String>,
    pub key: String,
}

impl DeepMatch {
    /// Full path from the root to the matched item.
    pub fn full_path(&self) -> Vec<String> {
        let mut full = self.path.clone();
        full.push(self.key.clone());
        full
    }
}

/// Keys of `data` matching `key`.
///
/// A direct member wins outright. Otherwise, with `key_is_pattern` the key is
/// compiled as a regex and tested against every data key; without it every
/// data key is treated as a regex and tested against the literal key.
pub fn get_matches<T: MatchTree + ?Sized>(data: &T, key: &str, key_is_pattern: bool) -> Vec<String> {
    if data.has_child(key) {
        return vec![key.to_string()];
    }
    data.child_keys()
        .into_iter()
        .filter(|data_key| {
            if key_is_pattern {
                pattern::is_match(key, data_key)
            } else {
                pattern::is_match(data_key, key)
            }
        })
        .collect()
}

/// Resolve every terminal of `match_tree` against `data`.
///
/// Returns one entry per matched data key for each non-object leaf, in
/// traversal order, without duplicates.
pub fn get_deep_matches<T: MatchTree>(data: &T, match_tree: &Value) -> Vec<DeepMatch> {
    let mut out = Vec::new();
    if let Value::Object(tree) = match_tree {
        let mut path = Vec::new();
        deep_walk(data, tree, &mut path, &mut out);
    }
    out
}

fn deep_walk<T: MatchTree>(
    data: &T,
    tree: &Map<String, Value>,
    path: &mut Vec<String>,
    out: &mut Vec<DeepMatch>,
) {
    for (tree_key, tree_value) in tree {
        for key in get_matches(data, tree_key, true) {
            match tree_value {
                Value::Object(sub) => {
                    if let Some(child) = data.child(&key).filter(|c| c.is_branch()) {
                        path.push(key);
                        deep_walk(child, sub, path, out);
                        path.pop();
                    }
                }
                _ => {
                    let found = DeepMatch {
                        path: path.clone(),
                        key,
                    };
                    if !out.contains(&found) {
                        out.push(found);
                    }
                }
            }
        }
    }
}

/// Visit every key of `data` that structurally matches `match_tree`, at
/// every depth, regardless of the descriptor's leaf values.
///
/// `cb(key, item)` runs for each match before recursion. Returning
/// `Some(redirect)` makes the walk descend into `item[redirect]` instead of
/// `item`, stepping over one wrapper level.
pub fn search_any_matches<T, F>(data: &mut T, match_tree: &Value, cb: &mut F)
where
    T: MatchTree,
    F: FnMut(&str, &mut T) -> Option<String>,
{
    let Value::Object(tree) = match_tree else {
        return;
    };
    for (tree_key, tree_value) in tree {
        for key in get_matches(data, tree_key, true) {
            let Some(item) = data.child_mut(&key) else {
                continue;
            };
            let redirect = cb(&key, item);
            if !tree_value.is_object() {
                continue;
            }
            let target = match redirect {
                Some(inner) => match item.child_mut(&inner) {
                    Some(wrapped) => wrapped,
                    None => continue,
                },
                None => item,
            };
            if target.is_branch() {
                search_any_matches(target, tree_value, cb);
            }
        }
    }
}

/// Delete every subtree of `data` whose full path matches a terminal of
/// `match_tree`, provided `cb(key, item)` allows it. Returns the number of
/// subtrees removed.
pub fn remove_strict_matches<T, F>(data: &mut T, match_tree: &Value, cb: &mut F) -> usize
where
    T: MatchTree,
    F: FnMut(&str, &T) -> bool,
{
    let Value::Object(tree) = match_tree else {
        return 0;
    };
    let mut removed = 0;
    for (tree_key, tree_value) in tree {
        for key in get_matches(data, tree_key, true) {
            if tree_value.is_object() {
                if let Some(child) = data.child_mut(&key).filter(|c| c.is_branch()) {
                    removed += remove_strict_matches(child, tree_value, cb);
                }
                continue;
            }
            let allowed = data.child(&key).is_some_and(|item| cb(&key, item));
            if allowed {
                data.remove_child(&key);
                removed += 1;
            }
        }
    }
    removed
}

/// Keep only the parts of `data` addressed by `match_tree`, deleting every
/// other key that `cb(key, item)` allows to be deleted.
///
/// Children are resolved before their parent is judged. With `strict`, a
/// branch survives only when something inside it matched the full path;
/// without it a match on the branch itself is enough even when nothing below
/// matched.
pub fn preserve_strict_matches<T, F>(data: &mut T, match_tree: &Value, strict: bool, cb: &mut F)
where
    T: MatchTree,
    F: FnMut(&str, &T) -> bool,
{
    if match_tree.is_object() {
        preserve_level(data, match_tree, strict, cb);
    }
}

/// One level of [`preserve_strict_matches`]. Returns whether anything at
/// this level was retained as a match.
fn preserve_level<T, F>(data: &mut T, match_tree: &Value, strict: bool, cb: &mut F) -> bool
where
    T: MatchTree,
    F: FnMut(&str, &T) -> bool,
{
    let Value::Object(tree) = match_tree else {
        return true;
    };
    let mut retained: Vec<String> = Vec::new();
    for (tree_key, tree_value) in tree {
        for key in get_matches(data, tree_key, true) {
            let keep = if tree_value.is_object() {
                match data.child_mut(&key) {
                    Some(child) if child.is_branch() => {
                        preserve_level(child, tree_value, strict, cb) || !strict
                    }
                    Some(_) => !strict,
                    None => false,
                }
            } else {
                true
            };
            if keep && !retained.contains(&key) {
                retained.push(key);
            }
        }
    }
    for key in data.child_keys() {
        if retained.contains(&key) {
            continue;
        }
        let deletable = data.child(&key).is_some_and(|item| cb(&key, item));
        if deletable {
            data.remove_child(&key);
        }
    }
    !retained.is_empty()
}

/// Follow `path` from `root`, returning the node it addresses.
pub fn node_at_mut<'a>(root: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in path {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}
