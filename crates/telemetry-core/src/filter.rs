//! Pre-fetch pruning of the property set.
//!
//! Data actions are replayed against a [`Skeleton`] of the output shape
//! before anything is fetched, so properties whose results would be thrown
//! away are never collected. Conditional actions cannot be judged without
//! data: they only mark the nodes they touch as preserved, and preserved
//! nodes are never pruned.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hasher;
use std::sync::Arc;

use dashmap::DashMap;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actions::{ActionKind, DataAction};
use crate::matcher::{preserve_strict_matches, remove_strict_matches, search_any_matches, MatchTree};
use crate::property::CompiledProperty;

/// Filter configuration carried by the declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOptions {
    /// Folder partitions switched off as a unit, e.g. `tmstats`.
    #[serde(default)]
    pub disabled_folders: BTreeSet<String>,
}

impl FilterOptions {
    pub fn is_folder_disabled(&self, folder: &str) -> bool {
        self.disabled_folders.contains(folder)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SkeletonFlag {
    #[default]
    Untouched,
    Preserve,
}

/// One node of the skeleton. `nested` is `Some` for parent groupings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkeletonNode {
    pub flag: SkeletonFlag,
    pub nested: Option<BTreeMap<String, SkeletonNode>>,
}

impl SkeletonNode {
    fn branch() -> Self {
        Self {
            flag: SkeletonFlag::Untouched,
            nested: Some(BTreeMap::new()),
        }
    }

    pub fn is_preserved(&self) -> bool {
        self.flag == SkeletonFlag::Preserve
    }

    /// Mark this node and everything below it as preserved.
    fn preserve_subtree(&mut self) {
        self.flag = SkeletonFlag::Preserve;
        for child in self.nested.iter_mut().flat_map(|n| n.values_mut()) {
            child.preserve_subtree();
        }
    }
}

impl MatchTree for SkeletonNode {
    fn child_keys(&self) -> Vec<String> {
        self.nested
            .as_ref()
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn has_child(&self, key: &str) -> bool {
        self.nested.as_ref().is_some_and(|n| n.contains_key(key))
    }

    fn child(&self, key: &str) -> Option<&Self> {
        self.nested.as_ref()?.get(key)
    }

    fn child_mut(&mut self, key: &str) -> Option<&mut Self> {
        self.nested.as_mut()?.get_mut(key)
    }

    fn remove_child(&mut self, key: &str) {
        if let Some(nested) = self.nested.as_mut() {
            nested.remove(key);
        }
    }

    fn is_branch(&self) -> bool {
        self.nested.is_some()
    }
}

/// Output shape of a property set, keyed by stat name.
#[derive(Debug, Clone, PartialEq)]
pub struct Skeleton {
    root: SkeletonNode,
}

impl Skeleton {
    /// Build the skeleton for `properties`, leaving out properties in
    /// disabled folders.
    pub fn build(properties: &[CompiledProperty], options: &FilterOptions) -> Self {
        let mut root = SkeletonNode::branch();
        for property in properties {
            let Some(nested) = root.nested.as_mut() else {
                break;
            };
            match property.parent_key() {
                Some(parent) => {
                    if property.is_folder() && options.is_folder_disabled(parent) {
                        tracing::debug!(
                            "skipping '{}': folder '{parent}' is disabled",
                            property.name
                        );
                        continue;
                    }
                    let parent_node = nested
                        .entry(parent.to_string())
                        .or_insert_with(SkeletonNode::branch);
                    parent_node
                        .nested
                        .get_or_insert_with(BTreeMap::new)
                        .insert(property.name.clone(), SkeletonNode::default());
                }
                None => {
                    nested
                        .entry(property.name.clone())
                        .or_insert_with(SkeletonNode::default);
                }
            }
        }
        Self { root }
    }

    /// Replay one data action against the skeleton.
    pub fn apply(&mut self, action: &DataAction) {
        if !action.enable {
            return;
        }
        // Tags written under `locations` can be addressed by later actions,
        // so nothing beneath a tagged node may be pruned.
        if let ActionKind::SetTag {
            locations: Some(locations),
            ..
        } = &action.kind
        {
            search_any_matches(&mut self.root, locations, &mut |_: &str, node: &mut SkeletonNode| {
                node.preserve_subtree();
                None
            });
        }
        if let Some(condition) = &action.condition {
            for tree in condition.trees() {
                search_any_matches(&mut self.root, tree, &mut |_: &str, node: &mut SkeletonNode| {
                    node.flag = SkeletonFlag::Preserve;
                    None
                });
            }
            return;
        }
        let mut allow = |_: &str, node: &SkeletonNode| !node.is_preserved();
        match &action.kind {
            ActionKind::ExcludeData { locations } => {
                remove_strict_matches(&mut self.root, locations, &mut allow);
            }
            ActionKind::IncludeData { locations } => {
                preserve_strict_matches(&mut self.root, locations, false, &mut allow);
            }
            ActionKind::SetTag { .. } => {}
        }
    }

    /// Whether the node at `path` is still present.
    pub fn contains_path(&self, path: &[String]) -> bool {
        let mut node = &self.root;
        for segment in path {
            match node.child(segment) {
                Some(next) => node = next,
                None => return false,
            }
        }
        true
    }
}

fn skeleton_path(property: &CompiledProperty) -> Vec<String> {
    match property.parent_key() {
        Some(parent) => vec![parent.to_string(), property.name.clone()],
        None => vec![property.name.clone()],
    }
}

/// Names of the properties that survive `actions`.
pub fn filter_properties(
    properties: &[CompiledProperty],
    actions: &[DataAction],
    options: &FilterOptions,
) -> BTreeSet<String> {
    let mut skeleton = Skeleton::build(properties, options);
    for action in actions {
        skeleton.apply(action);
    }
    properties
        .iter()
        .filter(|p| skeleton.contains_path(&skeleton_path(p)))
        .map(|p| p.name.clone())
        .collect()
}

/// Memoizes [`filter_properties`] by a fingerprint of its inputs.
#[derive(Debug, Default)]
pub struct StatsFilterCache {
    entries: DashMap<u64, Arc<BTreeSet<String>>>,
}

impl StatsFilterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute(
        &self,
        properties: &[CompiledProperty],
        actions: &[DataAction],
        options: &FilterOptions,
    ) -> Arc<BTreeSet<String>> {
        let key = fingerprint(properties, actions, options);
        if let Some(hit) = self.entries.get(&key) {
            return hit.value().clone();
        }
        let survivors = Arc::new(filter_properties(properties, actions, options));
        tracing::debug!(
            "stats filter kept {} of {} properties",
            survivors.len(),
            properties.len()
        );
        self.entries.insert(key, survivors.clone());
        survivors
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// FNV-1a hash of the canonical JSON form of the filter inputs.
pub fn fingerprint(
    properties: &[CompiledProperty],
    actions: &[DataAction],
    options: &FilterOptions,
) -> u64 {
    let shape: Vec<Value> = properties
        .iter()
        .map(|p| json!([p.name, p.parent_key(), p.is_folder()]))
        .collect();
    let canonical = json!({
        "properties": shape,
        "actions": actions,
        "options": options,
    });
    let mut hasher = FnvHasher::default();
    hasher.write(canonical.to_string().as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::test_support::compiled;
    use serde_json::json;

    fn action(value: Value) -> DataAction {
        serde_json::from_value(value).unwrap()
    }

    fn props() -> Vec<CompiledProperty> {
        vec![
            compiled("hostname", json!({"key": "sys/global-settings::hostname", "structure": {"parentKey": "system"}})),
            compiled("version", json!({"key": "sys/version", "structure": {"parentKey": "system"}})),
            compiled("virtualServers", json!({"key": "ltm/virtual/stats"})),
            compiled("pools", json!({"key": "ltm/pool/stats"})),
            compiled("cpuInfoStat", json!({"key": "tmstats/cpu", "structure": {"parentKey": "tmstats", "folder": true}})),
        ]
    }

    fn names(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_exclude_only_property_leaves_nothing() {
        let properties = vec![compiled("p1", json!({"key": "p1"}))];
        let actions = vec![action(json!({
            "enable": true, "excludeData": {}, "locations": {"p1": true}
        }))];
        let survivors = filter_properties(&properties, &actions, &FilterOptions::default());
        assert!(survivors.is_empty());
    }

    #[test]
    fn test_no_actions_keeps_everything() {
        let survivors = filter_properties(&props(), &[], &FilterOptions::default());
        assert_eq!(survivors.len(), 5);
    }

    #[test]
    fn test_disabled_folder_skipped() {
        let options = FilterOptions {
            disabled_folders: ["tmstats".to_string()].into_iter().collect(),
        };
        let survivors = filter_properties(&props(), &[], &options);
        assert!(!survivors.contains("cpuInfoStat"));
        assert_eq!(survivors.len(), 4);
    }

    #[test]
    fn test_include_is_non_strict() {
        let actions = vec![action(json!({
            "includeData": {}, "locations": {"system": {"hostname": true}, "virtualServers": {"vs1": true}}
        }))];
        let survivors = filter_properties(&props(), &actions, &FilterOptions::default());
        // virtualServers is a leaf in the skeleton but the path continues past it
        assert_eq!(names(&survivors), vec!["hostname", "virtualServers"]);
    }

    #[test]
    fn test_conditional_action_preserves() {
        let actions = vec![
            action(json!({
                "ifAllMatch": {"pools": {"/Common/p1": {"members": 2}}},
                "setTag": {"x": "y"}
            })),
            action(json!({"excludeData": {}, "locations": {"pools": true, "virtualServers": true}})),
        ];
        let survivors = filter_properties(&props(), &actions, &FilterOptions::default());
        assert!(survivors.contains("pools"));
        assert!(!survivors.contains("virtualServers"));
    }

    #[test]
    fn test_conditional_exclude_removes_nothing() {
        let actions = vec![action(json!({
            "ifAllMatch": {"system": {"hostname": "x"}},
            "excludeData": {},
            "locations": {"system": true}
        }))];
        let survivors = filter_properties(&props(), &actions, &FilterOptions::default());
        assert_eq!(survivors.len(), 5);
    }

    #[test]
    fn test_filter_is_monotonic() {
        let base = vec![action(json!({"excludeData": {}, "locations": {"pools": true}}))];
        let mut more = base.clone();
        more.push(action(json!({"excludeData": {}, "locations": {"system": {"version": true}}})));
        let fewer = filter_properties(&props(), &more, &FilterOptions::default());
        let wider = filter_properties(&props(), &base, &FilterOptions::default());
        assert!(fewer.is_subset(&wider));
        assert!(!fewer.contains("version"));
        assert!(fewer.contains("hostname"));
    }

    #[test]
    fn test_any_match_never_shrinks_survivors() {
        let base = vec![action(json!({"excludeData": {}, "locations": {"pools": true}}))];
        let mut guarded = vec![action(json!({
            "ifAnyMatch": [{"pools": {"/Common/p1": {"members": 2}}}, {"system": {"hostname": "x"}}],
            "setTag": {"x": "y"}
        }))];
        guarded.extend(base.iter().cloned());

        let narrow = filter_properties(&props(), &base, &FilterOptions::default());
        let wide = filter_properties(&props(), &guarded, &FilterOptions::default());
        assert!(narrow.is_subset(&wide));
        assert!(!narrow.contains("pools"));
        assert!(wide.contains("pools"));
    }

    #[test]
    fn test_set_tag_locations_are_kept_whole() {
        let actions = vec![
            action(json!({"setTag": {"site": "dc1"}, "locations": {"system": true}})),
            action(json!({"includeData": {}, "locations": {"system": {"site": true}}})),
        ];
        let survivors = filter_properties(&props(), &actions, &FilterOptions::default());
        assert_eq!(names(&survivors), vec!["hostname", "version"]);

        let untagged = vec![action(json!({"includeData": {}, "locations": {"system": {"site": true}}}))];
        assert!(filter_properties(&props(), &untagged, &FilterOptions::default()).is_empty());
    }

    #[test]
    fn test_cache_memoizes_by_inputs() {
        let cache = StatsFilterCache::new();
        let actions = vec![action(json!({"excludeData": {}, "locations": {"pools": true}}))];
        let first = cache.get_or_compute(&props(), &actions, &FilterOptions::default());
        let second = cache.get_or_compute(&props(), &actions, &FilterOptions::default());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        cache.get_or_compute(&props(), &[], &FilterOptions::default());
        assert_eq!(cache.len(), 2);
        assert_ne!(
            fingerprint(&props(), &actions, &FilterOptions::default()),
            fingerprint(&props(), &[], &FilterOptions::default())
        );
    }
}
