//! Dependency graph between flags and segments.
//!
//! A flag depends on another flag when it lists it as a prerequisite, and on a segment when one of
//! its rules contains a segment-match clause naming that segment. Segments may depend on other
//! segments the same way.
//!
//! The graph serves two purposes:
//! - ordering writes so that nothing is stored before the items it references
//!   ([`sort_all_collections`], [`sort_change_set`]);
//! - expanding a changed item into the set of items whose evaluation may now differ
//!   ([`DependencyTracker::add_affected_items`]).
use std::collections::{HashMap, HashSet};

use crate::store_types::{ChangeSet, DataKind, FullDataSet, Item, ItemDescriptor, KeyedItems};

/// Identity of a stored item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KindAndKey {
    pub kind: DataKind,
    pub key: String,
}

impl KindAndKey {
    pub fn new(kind: DataKind, key: impl Into<String>) -> KindAndKey {
        KindAndKey {
            kind,
            key: key.into(),
        }
    }

    pub fn flag(key: impl Into<String>) -> KindAndKey {
        KindAndKey::new(DataKind::Features, key)
    }

    pub fn segment(key: impl Into<String>) -> KindAndKey {
        KindAndKey::new(DataKind::Segments, key)
    }
}

/// Returns the items referenced by `item`, in order of first reference, without duplicates.
///
/// Prerequisites come first, followed by segments referenced from rules. Unknown kinds, deletion
/// records, and a missing descriptor all yield no dependencies.
pub fn compute_dependencies_from(
    kind: &DataKind,
    item: Option<&ItemDescriptor>,
) -> Vec<KindAndKey> {
    let mut result = Vec::new();
    let mut push = |dependency: KindAndKey| {
        if !result.contains(&dependency) {
            result.push(dependency);
        }
    };

    match (kind, item.and_then(|descriptor| descriptor.item.as_ref())) {
        (DataKind::Features, Some(Item::Flag(flag))) => {
            for prerequisite in &flag.prerequisites {
                push(KindAndKey::flag(prerequisite.key.as_str()));
            }
            for clause in flag.rules.iter().flat_map(|rule| &rule.clauses) {
                for segment in clause.referenced_segments() {
                    push(KindAndKey::segment(segment));
                }
            }
        }
        (DataKind::Segments, Some(Item::Segment(segment))) => {
            for clause in segment.rules.iter().flat_map(|rule| &rule.clauses) {
                for referenced in clause.referenced_segments() {
                    push(KindAndKey::segment(referenced));
                }
            }
        }
        _ => {}
    }

    result
}

/// Set of affected items that remembers insertion order.
///
/// The order is the order in which the graph traversal discovered the items. It is only
/// meaningful within a single computation.
#[derive(Debug, Default, Clone)]
pub struct AffectedItems {
    order: Vec<KindAndKey>,
    seen: HashSet<KindAndKey>,
}

impl AffectedItems {
    pub fn new() -> AffectedItems {
        AffectedItems::default()
    }

    /// Returns `false` if the item was already present.
    pub fn insert(&mut self, item: KindAndKey) -> bool {
        if self.seen.contains(&item) {
            return false;
        }
        self.seen.insert(item.clone());
        self.order.push(item);
        true
    }

    pub fn contains(&self, item: &KindAndKey) -> bool {
        self.seen.contains(item)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KindAndKey> {
        self.order.iter()
    }

    /// Keys of affected flags. Segments are not externally observable, so they are skipped.
    pub fn flag_keys(&self) -> impl Iterator<Item = &str> {
        self.order
            .iter()
            .filter(|item| item.kind == DataKind::Features)
            .map(|item| item.key.as_str())
    }

    pub fn to_set(&self) -> HashSet<KindAndKey> {
        self.seen.clone()
    }
}

impl IntoIterator for AffectedItems {
    type Item = KindAndKey;
    type IntoIter = std::vec::IntoIter<KindAndKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.into_iter()
    }
}

/// Incrementally maintained dependency graph.
///
/// Items are interned into dense ids on first sight and keep them until [`reset`]. Both edge
/// directions are stored as adjacency lists indexed by id.
///
/// [`reset`]: DependencyTracker::reset
#[derive(Debug, Default)]
pub struct DependencyTracker {
    ids: HashMap<KindAndKey, usize>,
    nodes: Vec<KindAndKey>,
    /// `depends_on[a]` lists the items `a` references.
    depends_on: Vec<Vec<usize>>,
    /// `depended_on_by[b]` lists the items referencing `b`.
    depended_on_by: Vec<Vec<usize>>,
}

impl DependencyTracker {
    pub fn new() -> DependencyTracker {
        DependencyTracker::default()
    }

    fn intern(&mut self, item: KindAndKey) -> usize {
        if let Some(&id) = self.ids.get(&item) {
            return id;
        }
        let id = self.nodes.len();
        self.ids.insert(item.clone(), id);
        self.nodes.push(item);
        self.depends_on.push(Vec::new());
        self.depended_on_by.push(Vec::new());
        id
    }

    /// Replace the outgoing edges of `(kind, key)` with the ones computed from `item`.
    ///
    /// Must be called for deletions too (with a deletion record or `None`) so that edges of the
    /// deleted item are dropped.
    pub fn update_dependencies_from(
        &mut self,
        kind: &DataKind,
        key: &str,
        item: Option<&ItemDescriptor>,
    ) {
        let id = self.intern(KindAndKey::new(kind.clone(), key));

        let new_edges: Vec<usize> = compute_dependencies_from(kind, item)
            .into_iter()
            .map(|dependency| self.intern(dependency))
            .collect();

        let old_edges = std::mem::replace(&mut self.depends_on[id], new_edges);
        for old in old_edges {
            self.depended_on_by[old].retain(|&dependent| dependent != id);
        }
        for index in 0..self.depends_on[id].len() {
            let new = self.depends_on[id][index];
            self.depended_on_by[new].push(id);
        }
    }

    /// Add `item` and everything that transitively depends on it to `result`.
    ///
    /// Items already present in `result` are not expanded again, which also makes the traversal
    /// terminate on cyclic graphs.
    pub fn add_affected_items(&self, result: &mut AffectedItems, item: &KindAndKey) {
        if !result.insert(item.clone()) {
            return;
        }
        let Some(&start) = self.ids.get(item) else {
            return;
        };

        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            for &dependent in &self.depended_on_by[id] {
                if result.insert(self.nodes[dependent].clone()) {
                    stack.push(dependent);
                }
            }
        }
    }

    /// Drop all edges.
    pub fn reset(&mut self) {
        self.ids.clear();
        self.nodes.clear();
        self.depends_on.clear();
        self.depended_on_by.clear();
    }
}

/// Order a full data set so that it can be written front to back without ever writing an item
/// before something it references.
pub fn sort_all_collections(data_set: FullDataSet) -> FullDataSet {
    FullDataSet {
        data: sort_data(data_set.data),
        should_persist: data_set.should_persist,
    }
}

/// Same as [`sort_all_collections`] for a change set. Everything except the data order is kept.
pub fn sort_change_set(change_set: ChangeSet) -> ChangeSet {
    ChangeSet {
        data: sort_data(change_set.data),
        ..change_set
    }
}

fn sort_data(mut data: Vec<(DataKind, KeyedItems)>) -> Vec<(DataKind, KeyedItems)> {
    // Stable, so unknown kinds keep their relative order.
    data.sort_by_key(|(kind, _)| match kind.priority() {
        Some(priority) => (0, priority),
        None => (1, 0),
    });

    data.into_iter()
        .map(|(kind, items)| {
            let items = sort_items(&kind, items);
            (kind, items)
        })
        .collect()
}

/// Depth-first topological sort of items within one kind.
///
/// Each item in input order first emits its not-yet-emitted same-kind dependencies. An item that
/// is still on the stack counts as emitted, which breaks cycles.
fn sort_items(kind: &DataKind, items: KeyedItems) -> KeyedItems {
    if kind.priority().is_none() || items.len() < 2 {
        return items;
    }

    let mut positions: HashMap<&str, usize> = HashMap::with_capacity(items.len());
    for (index, (key, _)) in items.iter().enumerate() {
        positions.entry(key.as_str()).or_insert(index);
    }

    let edges: Vec<Vec<usize>> = items
        .iter()
        .map(|(_, descriptor)| {
            compute_dependencies_from(kind, Some(descriptor))
                .into_iter()
                .filter(|dependency| &dependency.kind == kind)
                .filter_map(|dependency| positions.get(dependency.key.as_str()).copied())
                .collect()
        })
        .collect();

    let mut visited = vec![false; items.len()];
    let mut order = Vec::with_capacity(items.len());
    // (node, index of the next edge to follow)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..items.len() {
        if visited[root] {
            continue;
        }
        visited[root] = true;
        stack.push((root, 0));

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            match edges[node].get(top.1) {
                Some(&dependency) => {
                    top.1 += 1;
                    if !visited[dependency] {
                        visited[dependency] = true;
                        stack.push((dependency, 0));
                    }
                }
                None => {
                    order.push(node);
                    stack.pop();
                }
            }
        }
    }

    let mut slots: Vec<Option<(String, ItemDescriptor)>> = items.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{
        compute_dependencies_from, sort_all_collections, sort_change_set, AffectedItems,
        DependencyTracker, KindAndKey,
    };
    use crate::data_model::{Clause, FeatureFlag, Operator, Segment};
    use crate::store_types::{
        ChangeSet, ChangeSetType, DataKind, FullDataSet, ItemDescriptor, KeyedItems, Selector,
    };

    fn flag_item(flag: FeatureFlag) -> (String, ItemDescriptor) {
        (flag.key.clone(), flag.into())
    }

    fn segment_item(segment: Segment) -> (String, ItemDescriptor) {
        (segment.key.clone(), segment.into())
    }

    fn keys(items: &KeyedItems) -> Vec<&str> {
        items.iter().map(|(key, _)| key.as_str()).collect()
    }

    fn affected(tracker: &DependencyTracker, item: KindAndKey) -> HashSet<KindAndKey> {
        let mut result = AffectedItems::new();
        tracker.add_affected_items(&mut result, &item);
        result.to_set()
    }

    fn update(tracker: &mut DependencyTracker, kind: DataKind, item: (String, ItemDescriptor)) {
        tracker.update_dependencies_from(&kind, &item.0, Some(&item.1));
    }

    fn position(keys: &[&str], key: &str) -> usize {
        keys.iter().position(|k| *k == key).unwrap()
    }

    #[test]
    fn dependencies_of_flag_in_reference_order() {
        let plain: ItemDescriptor = FeatureFlag::new("key", 1).into();
        assert!(compute_dependencies_from(&DataKind::Features, Some(&plain)).is_empty());

        let flag: ItemDescriptor = FeatureFlag::new("key", 1)
            .with_prerequisite("flag2", 0)
            .with_prerequisite("flag3", 0)
            .with_rule(vec![
                Clause::new("key", Operator::In, vec!["ignore".into()]),
                Clause::matching_segments(["segment1", "segment2"]),
            ])
            .with_rule(vec![Clause::matching_segments(["segment3", "segment1"])])
            .into();

        assert_eq!(
            compute_dependencies_from(&DataKind::Features, Some(&flag)),
            vec![
                KindAndKey::flag("flag2"),
                KindAndKey::flag("flag3"),
                KindAndKey::segment("segment1"),
                KindAndKey::segment("segment2"),
                KindAndKey::segment("segment3"),
            ]
        );
    }

    #[test]
    fn dependencies_of_segment() {
        let plain: ItemDescriptor = Segment::new("segment", 1).into();
        assert!(compute_dependencies_from(&DataKind::Segments, Some(&plain)).is_empty());

        let nested: ItemDescriptor = Segment::new("segment", 1)
            .with_rule(vec![Clause::matching_segments(["other"])])
            .into();
        assert_eq!(
            compute_dependencies_from(&DataKind::Segments, Some(&nested)),
            vec![KindAndKey::segment("other")]
        );
    }

    #[test]
    fn no_dependencies_for_unknown_kind_or_missing_item() {
        let item = ItemDescriptor::new(1, serde_json::json!({"key": "x"}));
        let other = DataKind::Other("test-items".to_owned());
        assert!(compute_dependencies_from(&other, Some(&item)).is_empty());

        assert!(compute_dependencies_from(
            &DataKind::Features,
            Some(&ItemDescriptor::deleted(1))
        )
        .is_empty());
        assert!(compute_dependencies_from(&DataKind::Features, None).is_empty());
    }

    #[test]
    fn unknown_item_affects_only_itself() {
        let tracker = DependencyTracker::new();

        assert_eq!(
            affected(&tracker, KindAndKey::flag("flag1")),
            HashSet::from([KindAndKey::flag("flag1")])
        );
    }

    #[test]
    fn tracker_builds_graph() {
        let mut tracker = DependencyTracker::new();

        update(
            &mut tracker,
            DataKind::Segments,
            segment_item(Segment::new("segment1", 1)),
        );
        update(
            &mut tracker,
            DataKind::Segments,
            segment_item(
                Segment::new("segment2", 1)
                    .with_rule(vec![Clause::matching_segments(["segment3"])]),
            ),
        );
        update(
            &mut tracker,
            DataKind::Segments,
            segment_item(Segment::new("segment3", 1)),
        );
        update(
            &mut tracker,
            DataKind::Features,
            flag_item(
                FeatureFlag::new("flag1", 1)
                    .with_prerequisite("flag2", 0)
                    .with_prerequisite("flag3", 0)
                    .with_rule(vec![Clause::matching_segments(["segment1", "segment2"])]),
            ),
        );
        update(
            &mut tracker,
            DataKind::Features,
            flag_item(
                FeatureFlag::new("flag2", 1)
                    .with_prerequisite("flag4", 0)
                    .with_rule(vec![Clause::matching_segments(["segment2"])]),
            ),
        );

        assert_eq!(
            affected(&tracker, KindAndKey::flag("flag1")),
            HashSet::from([KindAndKey::flag("flag1")])
        );
        assert_eq!(
            affected(&tracker, KindAndKey::flag("flag2")),
            HashSet::from([KindAndKey::flag("flag2"), KindAndKey::flag("flag1")])
        );
        assert_eq!(
            affected(&tracker, KindAndKey::flag("flag3")),
            HashSet::from([KindAndKey::flag("flag3"), KindAndKey::flag("flag1")])
        );
        assert_eq!(
            affected(&tracker, KindAndKey::segment("segment1")),
            HashSet::from([KindAndKey::segment("segment1"), KindAndKey::flag("flag1")])
        );
        assert_eq!(
            affected(&tracker, KindAndKey::segment("segment2")),
            HashSet::from([
                KindAndKey::segment("segment2"),
                KindAndKey::flag("flag1"),
                KindAndKey::flag("flag2"),
            ])
        );
        assert_eq!(
            affected(&tracker, KindAndKey::segment("segment3")),
            HashSet::from([
                KindAndKey::segment("segment3"),
                KindAndKey::segment("segment2"),
                KindAndKey::flag("flag1"),
                KindAndKey::flag("flag2"),
            ])
        );
    }

    #[test]
    fn tracker_replaces_edges_on_update() {
        let mut tracker = DependencyTracker::new();
        update(
            &mut tracker,
            DataKind::Features,
            flag_item(FeatureFlag::new("flag1", 1).with_prerequisite("flag3", 0)),
        );
        update(
            &mut tracker,
            DataKind::Features,
            flag_item(FeatureFlag::new("flag2", 1).with_prerequisite("flag3", 0)),
        );

        assert_eq!(
            affected(&tracker, KindAndKey::flag("flag3")),
            HashSet::from([
                KindAndKey::flag("flag3"),
                KindAndKey::flag("flag2"),
                KindAndKey::flag("flag1"),
            ])
        );

        update(
            &mut tracker,
            DataKind::Features,
            flag_item(FeatureFlag::new("flag1", 2).with_prerequisite("flag4", 0)),
        );

        assert_eq!(
            affected(&tracker, KindAndKey::flag("flag3")),
            HashSet::from([KindAndKey::flag("flag3"), KindAndKey::flag("flag2")])
        );
        assert_eq!(
            affected(&tracker, KindAndKey::flag("flag4")),
            HashSet::from([KindAndKey::flag("flag4"), KindAndKey::flag("flag1")])
        );
    }

    #[test]
    fn deletion_clears_edges() {
        let mut tracker = DependencyTracker::new();
        update(
            &mut tracker,
            DataKind::Features,
            flag_item(FeatureFlag::new("flag1", 1).with_prerequisite("flag2", 0)),
        );
        tracker.update_dependencies_from(
            &DataKind::Features,
            "flag1",
            Some(&ItemDescriptor::deleted(2)),
        );

        assert_eq!(
            affected(&tracker, KindAndKey::flag("flag2")),
            HashSet::from([KindAndKey::flag("flag2")])
        );
    }

    #[test]
    fn tracker_reset_drops_graph() {
        let mut tracker = DependencyTracker::new();
        update(
            &mut tracker,
            DataKind::Features,
            flag_item(FeatureFlag::new("flag1", 1).with_prerequisite("flag3", 0)),
        );
        assert_eq!(affected(&tracker, KindAndKey::flag("flag3")).len(), 2);

        tracker.reset();

        assert_eq!(
            affected(&tracker, KindAndKey::flag("flag3")),
            HashSet::from([KindAndKey::flag("flag3")])
        );
    }

    fn cyclic_flags(length: usize) -> KeyedItems {
        (0..length)
            .map(|i| {
                flag_item(
                    FeatureFlag::new(format!("f{i}"), 1)
                        .with_prerequisite(format!("f{}", (i + 1) % length), 0),
                )
            })
            .collect()
    }

    #[test]
    fn cycles_terminate() {
        for length in 1..=4 {
            let items = cyclic_flags(length);

            let mut tracker = DependencyTracker::new();
            for item in items.clone() {
                update(&mut tracker, DataKind::Features, item);
            }
            let all: HashSet<KindAndKey> = (0..length)
                .map(|i| KindAndKey::flag(format!("f{i}")))
                .collect();
            assert_eq!(affected(&tracker, KindAndKey::flag("f0")), all);

            let sorted = sort_all_collections(FullDataSet::new(vec![(DataKind::Features, items)]));
            assert_eq!(sorted.data[0].1.len(), length, "cycle of length {length}");
        }
    }

    #[test]
    fn add_affected_items_accumulates() {
        let mut tracker = DependencyTracker::new();
        update(
            &mut tracker,
            DataKind::Features,
            flag_item(FeatureFlag::new("a", 1).with_prerequisite("b", 0)),
        );

        let mut result = AffectedItems::new();
        tracker.add_affected_items(&mut result, &KindAndKey::flag("b"));
        tracker.add_affected_items(&mut result, &KindAndKey::flag("a"));
        tracker.add_affected_items(&mut result, &KindAndKey::segment("s"));

        assert_eq!(result.len(), 3);
        assert_eq!(result.flag_keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    fn dependency_ordered_flags() -> KeyedItems {
        vec![
            flag_item(
                FeatureFlag::new("a", 1)
                    .with_prerequisite("b", 0)
                    .with_prerequisite("c", 0),
            ),
            flag_item(
                FeatureFlag::new("b", 1)
                    .with_prerequisite("c", 0)
                    .with_prerequisite("e", 0),
            ),
            flag_item(FeatureFlag::new("c", 1)),
            flag_item(FeatureFlag::new("d", 1)),
            flag_item(FeatureFlag::new("e", 1)),
            flag_item(FeatureFlag::new("f", 1)),
        ]
    }

    #[test]
    fn sort_all_collections_orders_kinds_and_items() {
        let input = FullDataSet::new(vec![
            (DataKind::Features, dependency_ordered_flags()),
            (
                DataKind::Segments,
                vec![
                    segment_item(
                        Segment::new("s1", 1).with_rule(vec![Clause::matching_segments(["s2"])]),
                    ),
                    segment_item(Segment::new("s2", 1)),
                ],
            ),
        ]);

        let sorted = sort_all_collections(input);

        assert_eq!(sorted.data[0].0, DataKind::Segments);
        assert_eq!(keys(&sorted.data[0].1), vec!["s2", "s1"]);

        assert_eq!(sorted.data[1].0, DataKind::Features);
        let flags = keys(&sorted.data[1].1);
        assert_eq!(flags.len(), 6);
        assert!(position(&flags, "c") < position(&flags, "b"));
        assert!(position(&flags, "e") < position(&flags, "b"));
        assert!(position(&flags, "b") < position(&flags, "a"));
        assert!(position(&flags, "c") < position(&flags, "a"));
        // Ties keep input order.
        assert!(position(&flags, "d") < position(&flags, "f"));
        assert!(sorted.should_persist);
    }

    #[test]
    fn sort_leaves_unknown_kinds_unchanged_and_last() {
        let other = DataKind::Other("test-items".to_owned());
        let other_items: KeyedItems = vec![
            ("z".to_owned(), ItemDescriptor::new(1, serde_json::json!(1))),
            ("y".to_owned(), ItemDescriptor::new(1, serde_json::json!(2))),
        ];
        let input = FullDataSet::new(vec![
            (other.clone(), other_items.clone()),
            (DataKind::Features, dependency_ordered_flags()),
            (DataKind::Segments, Vec::new()),
        ]);

        let sorted = sort_all_collections(input);

        assert_eq!(
            sorted.data.iter().map(|(kind, _)| kind).collect::<Vec<_>>(),
            vec![&DataKind::Segments, &DataKind::Features, &other]
        );
        assert_eq!(sorted.data[2].1, other_items);
    }

    #[test]
    fn sort_change_set_preserves_metadata() {
        let selector = Selector::new(42, "p:abc:42");
        let change_set = ChangeSet::partial(
            selector.clone(),
            vec![(DataKind::Features, dependency_ordered_flags())],
        )
        .with_environment_id("env-1")
        .with_should_persist(false);

        let sorted = sort_change_set(change_set);

        assert_eq!(sorted.change_set_type, ChangeSetType::Partial);
        assert_eq!(sorted.selector, selector);
        assert_eq!(sorted.environment_id.as_deref(), Some("env-1"));
        assert!(!sorted.should_persist);
        let flags = keys(&sorted.data[0].1);
        assert!(position(&flags, "b") < position(&flags, "a"));
    }

    #[test]
    fn sort_change_set_handles_empty_and_deleted() {
        let empty = sort_change_set(ChangeSet::full(Selector::EMPTY, Vec::new()));
        assert!(empty.data.is_empty());
        assert_eq!(empty.change_set_type, ChangeSetType::Full);

        let with_deleted = sort_change_set(ChangeSet::partial(
            Selector::EMPTY,
            vec![(
                DataKind::Features,
                vec![("flag1".to_owned(), ItemDescriptor::deleted(5))],
            )],
        ));
        assert_eq!(
            with_deleted.data[0].1,
            vec![("flag1".to_owned(), ItemDescriptor::deleted(5))]
        );
    }

    #[test]
    fn sorted_output_satisfies_topological_order() {
        // Prerequisites pointing forward, backward, and outside the set.
        let items: KeyedItems = (0..20)
            .map(|i| {
                let mut flag = FeatureFlag::new(format!("f{i}"), 1);
                for dep in [(i * 7 + 3) % 20, (i * 3 + 11) % 25] {
                    if dep > i || dep >= 20 {
                        flag = flag.with_prerequisite(format!("f{dep}"), 0);
                    }
                }
                flag_item(flag)
            })
            .collect();

        let sorted = sort_all_collections(FullDataSet::new(vec![(DataKind::Features, items)]));
        let order = keys(&sorted.data[0].1);
        assert_eq!(order.len(), 20);

        for (key, descriptor) in &sorted.data[0].1 {
            for dependency in compute_dependencies_from(&DataKind::Features, Some(descriptor)) {
                if let Some(dep_position) = order.iter().position(|k| *k == dependency.key) {
                    assert!(
                        dep_position < position(&order, key),
                        "{} must precede {key}",
                        dependency.key
                    );
                }
            }
        }
    }
}
