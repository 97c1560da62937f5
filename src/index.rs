use crate::*;

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;
use rayon::prelude::*;

pub const DEFAULT_MIN_FANOUT: usize = 2;
pub const DEFAULT_MAX_FANOUT: usize = 5;

enum Entries<L, V> {
    Leaf(Vec<(CostLabel<L>, V)>),
    Inner(Vec<Box<RTreeNode<L, V>>>),
}

struct RTreeNode<L, V> {
    /// Join of every key stored in this subtree, with its cost.
    bounding_box: CostLabel<L>,
    entries: Entries<L, V>,
}

impl<L: Clone, V> RTreeNode<L, V> {
    fn leaf(bounding_box: CostLabel<L>) -> Self {
        RTreeNode {
            bounding_box,
            entries: Entries::Leaf(Vec::new()),
        }
    }

    fn size(&self) -> usize {
        match &self.entries {
            Entries::Leaf(objects) => objects.len(),
            Entries::Inner(children) => children.len(),
        }
    }

    fn bb_at(&self, pos: usize) -> &CostLabel<L> {
        match &self.entries {
            Entries::Leaf(objects) => &objects[pos].0,
            Entries::Inner(children) => &children[pos].bounding_box,
        }
    }
}

/// A nearest-neighbor hit: the stored key, its value, their join with the
/// query, and the cost-gain distance to the query.
#[derive(Debug, Clone)]
pub struct Neighbor<L, V> {
    pub dist: Cost,
    pub joined: CostLabel<L>,
    pub key: CostLabel<L>,
    pub value: V,
}

/// Spatial index over cost-labels supporting subset queries, bulk subset
/// removal, and approximate nearest-neighbor search under the cost-gain
/// distance `cost(join(a,b)) - cost(a) - cost(b)`.
///
/// Fan-out stays within `[min_fanout, max_fanout]` on every mutation, except
/// that the root may underflow. A drained index is a single empty leaf whose
/// bounding box is the feature's top.
pub struct RTreeIndex<'f, F: Feature, V> {
    feature: &'f F,
    min_fanout: usize,
    max_fanout: usize,
    root: Box<RTreeNode<F::Label, V>>,
}

impl<'f, F: Feature, V> RTreeIndex<'f, F, V> {
    pub fn new(feature: &'f F) -> Self {
        Self::with_fanout(feature, DEFAULT_MIN_FANOUT, DEFAULT_MAX_FANOUT)
    }

    pub fn with_fanout(feature: &'f F, min_fanout: usize, max_fanout: usize) -> Self {
        // An overflowing node must split into two groups of at least
        // min_fanout entries.
        assert!(min_fanout >= 1 && max_fanout + 1 >= 2 * min_fanout);
        let top = Self::top_box(feature);
        RTreeIndex {
            feature,
            min_fanout,
            max_fanout,
            root: Box::new(RTreeNode::leaf(top)),
        }
    }

    fn top_box(feature: &F) -> CostLabel<F::Label> {
        let top = feature.top();
        CostLabel {
            cost: feature.cost(&top),
            label: top,
        }
    }

    pub fn len(&self) -> usize {
        fn count<L, V>(node: &RTreeNode<L, V>) -> usize {
            match &node.entries {
                Entries::Leaf(objects) => objects.len(),
                Entries::Inner(children) => children.iter().map(|c| count(c)).sum(),
            }
        }
        count(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.size() == 0
    }

    pub fn insert(&mut self, key: &CostLabel<F::Label>, value: V) {
        if let Some(sibling) = Self::insert_under(
            self.feature,
            self.min_fanout,
            self.max_fanout,
            &mut self.root,
            key,
            value,
        ) {
            let placeholder = Box::new(RTreeNode::leaf(Self::top_box(self.feature)));
            let old_root = std::mem::replace(&mut self.root, placeholder);
            let bounding_box = self
                .feature
                .cjoin(&old_root.bounding_box.label, &sibling.bounding_box.label);
            self.root = Box::new(RTreeNode {
                bounding_box,
                entries: Entries::Inner(vec![old_root, sibling]),
            });
        }
    }

    /// Descends toward the leaf whose bounding box grows the least, updating
    /// boxes on the way down; returns a split-off sibling for the caller to
    /// adopt when this node overflowed.
    fn insert_under(
        feature: &F,
        min_fanout: usize,
        max_fanout: usize,
        node: &mut RTreeNode<F::Label, V>,
        key: &CostLabel<F::Label>,
        value: V,
    ) -> Option<Box<RTreeNode<F::Label, V>>> {
        node.bounding_box = feature.cjoin(&node.bounding_box.label, &key.label);

        match &mut node.entries {
            Entries::Leaf(objects) => objects.push((key.clone(), value)),
            Entries::Inner(children) => {
                let mut best: Option<(Cost, Cost, usize)> = None;
                for (pos, child) in children.iter().enumerate() {
                    let joined = feature.cjoin(&child.bounding_box.label, &key.label);
                    let enlargement = joined.cost - child.bounding_box.cost;
                    let better = match best {
                        None => true,
                        Some((best_enlargement, best_cost, _)) => {
                            enlargement < best_enlargement
                                || (within_tolerance(enlargement, best_enlargement)
                                    && joined.cost < best_cost)
                        }
                    };
                    if better {
                        best = Some((enlargement, joined.cost, pos));
                    }
                }
                let (_, _, pos) = best.unwrap();

                if let Some(sibling) =
                    Self::insert_under(feature, min_fanout, max_fanout, &mut children[pos], key, value)
                {
                    children.insert(pos + 1, sibling);
                }
            }
        }

        Self::split_node(feature, min_fanout, max_fanout, node)
    }

    /// Quadratic split: seed the two groups with the pair whose join costs
    /// the most, then assign the rest by least enlargement.
    fn split_node(
        feature: &F,
        min_fanout: usize,
        max_fanout: usize,
        node: &mut RTreeNode<F::Label, V>,
    ) -> Option<Box<RTreeNode<F::Label, V>>> {
        let n = node.size();
        if n <= max_fanout {
            return None;
        }

        let mut seeds: Option<(Cost, usize, usize)> = None;
        for i in 0..n {
            for j in i + 1..n {
                let joined = feature.cjoin(&node.bb_at(i).label, &node.bb_at(j).label);
                if seeds.map_or(true, |(dist, _, _)| joined.cost > dist) {
                    seeds = Some((joined.cost, i, j));
                }
            }
        }
        let (_, a, b) = seeds.unwrap();

        let mut boxes = [node.bb_at(a).clone(), node.bb_at(b).clone()];
        let mut groups: [Vec<usize>; 2] = [vec![a], vec![b]];

        for i in 0..n {
            if i == a || i == b {
                continue;
            }
            // Entries left to place, this one included; a group that needs
            // all of them to reach min_fanout takes them unconditionally.
            let rest = (n - i - usize::from(i < a) - usize::from(i < b)) as isize;
            let g = if groups[0].len() as isize <= min_fanout as isize - rest {
                0
            } else if groups[1].len() as isize <= min_fanout as isize - rest {
                1
            } else {
                let joined = [
                    feature.cjoin(&node.bb_at(i).label, &boxes[0].label),
                    feature.cjoin(&node.bb_at(i).label, &boxes[1].label),
                ];
                let enlargement = [
                    joined[0].cost - boxes[0].cost,
                    joined[1].cost - boxes[1].cost,
                ];
                if !within_tolerance(enlargement[0], enlargement[1]) {
                    usize::from(enlargement[0] >= enlargement[1])
                } else if !within_tolerance(joined[0].cost, joined[1].cost) {
                    usize::from(joined[0].cost >= joined[1].cost)
                } else {
                    usize::from(groups[0].len() >= groups[1].len())
                }
            };
            boxes[g] = feature.cjoin(&boxes[g].label, &node.bb_at(i).label);
            groups[g].push(i);
        }

        for group in &groups {
            assert!(group.len() >= min_fanout && group.len() <= max_fanout);
        }
        assert_eq!(groups[0].len() + groups[1].len(), n);

        let [first_box, second_box] = boxes;
        let [first_group, second_group] = groups;
        node.bounding_box = first_box;

        let entries = match &mut node.entries {
            Entries::Leaf(objects) => {
                let mut drained: Vec<Option<(CostLabel<F::Label>, V)>> =
                    std::mem::take(objects).into_iter().map(Some).collect();
                *objects = first_group
                    .iter()
                    .map(|&i| drained[i].take().unwrap())
                    .collect();
                Entries::Leaf(
                    second_group
                        .iter()
                        .map(|&i| drained[i].take().unwrap())
                        .collect(),
                )
            }
            Entries::Inner(children) => {
                let mut drained: Vec<Option<Box<RTreeNode<F::Label, V>>>> =
                    std::mem::take(children).into_iter().map(Some).collect();
                *children = first_group
                    .iter()
                    .map(|&i| drained[i].take().unwrap())
                    .collect();
                Entries::Inner(
                    second_group
                        .iter()
                        .map(|&i| drained[i].take().unwrap())
                        .collect(),
                )
            }
        };

        Some(Box::new(RTreeNode {
            bounding_box: second_box,
            entries,
        }))
    }

    fn reset_root(&mut self) {
        self.root = Box::new(RTreeNode::leaf(Self::top_box(self.feature)));
    }

    fn recompute_bounding_box(feature: &F, node: &mut RTreeNode<F::Label, V>) {
        if node.size() == 0 {
            return;
        }
        let mut bounding_box = node.bb_at(0).clone();
        for pos in 1..node.size() {
            bounding_box = feature.cjoin(&bounding_box.label, &node.bb_at(pos).label);
        }
        node.bounding_box = bounding_box;
    }

    fn drain_values(node: &mut RTreeNode<F::Label, V>, acc: &mut Vec<V>) {
        match &mut node.entries {
            Entries::Leaf(objects) => {
                acc.extend(std::mem::take(objects).into_iter().map(|(_, v)| v));
            }
            Entries::Inner(children) => {
                for mut child in std::mem::take(children) {
                    Self::drain_values(&mut child, acc);
                }
            }
        }
    }

    /// Removes and returns every value whose key is a subset of the query.
    pub fn remove_subset(&mut self, query: &CostLabel<F::Label>) -> Vec<V> {
        let mut removed = Vec::new();
        if self.root.size() > 0 {
            Self::remove_subset_under(self.feature, &mut self.root, query, &mut removed);
            if self.root.size() == 0 {
                self.reset_root();
            }
        }
        removed
    }

    fn remove_subset_under(
        feature: &F,
        node: &mut RTreeNode<F::Label, V>,
        query: &CostLabel<F::Label>,
        removed: &mut Vec<V>,
    ) {
        if feature.subset(&node.bounding_box.label, &query.label) {
            // The whole subtree is covered; its stale bounding box is either
            // recomputed by the parent or reset with the root.
            Self::drain_values(node, removed);
            return;
        }

        match &mut node.entries {
            Entries::Leaf(objects) => {
                for (key, value) in std::mem::take(objects) {
                    if feature.subset(&key.label, &query.label) {
                        removed.push(value);
                    } else {
                        objects.push((key, value));
                    }
                }
            }
            Entries::Inner(children) => {
                for child in children.iter_mut() {
                    if feature.meet(&child.bounding_box.label, &query.label).is_some() {
                        Self::remove_subset_under(feature, child, query, removed);
                    }
                }
                children.retain(|c| c.size() > 0);
            }
        }

        Self::recompute_bounding_box(feature, node);
    }

    /// Returns every value whose key is a subset of the query.
    pub fn get_subset(&self, query: &CostLabel<F::Label>) -> Vec<V>
    where
        V: Clone,
    {
        let mut acc = Vec::new();
        if self.root.size() > 0 {
            Self::get_subset_under(self.feature, &self.root, query, &mut acc);
        }
        acc
    }

    fn get_subset_under(
        feature: &F,
        node: &RTreeNode<F::Label, V>,
        query: &CostLabel<F::Label>,
        acc: &mut Vec<V>,
    ) where
        V: Clone,
    {
        if feature.subset(&node.bounding_box.label, &query.label) {
            Self::collect_values(node, acc);
            return;
        }
        match &node.entries {
            Entries::Leaf(objects) => {
                for (key, value) in objects {
                    if feature.subset(&key.label, &query.label) {
                        acc.push(value.clone());
                    }
                }
            }
            Entries::Inner(children) => {
                for child in children {
                    if feature.meet(&child.bounding_box.label, &query.label).is_some() {
                        Self::get_subset_under(feature, child, query, acc);
                    }
                }
            }
        }
    }

    fn collect_values(node: &RTreeNode<F::Label, V>, acc: &mut Vec<V>)
    where
        V: Clone,
    {
        match &node.entries {
            Entries::Leaf(objects) => acc.extend(objects.iter().map(|(_, v)| v.clone())),
            Entries::Inner(children) => {
                for child in children {
                    Self::collect_values(child, acc);
                }
            }
        }
    }

    /// Best-first approximate k-nearest-neighbor search. Approximate because
    /// entries whose distances tie within tolerance surface in either order.
    pub fn get_knn_approx(&self, query: &CostLabel<F::Label>, k: usize) -> Vec<Neighbor<F::Label, V>>
    where
        V: Clone,
    {
        let mut result = Vec::new();
        let mut heap = BinaryHeap::new();

        let joined = self
            .feature
            .cjoin(&self.root.bounding_box.label, &query.label);
        heap.push(SearchEntry {
            dist: joined.cost - self.root.bounding_box.cost - query.cost,
            joined,
            target: Target::Node(&self.root),
        });

        while let Some(entry) = heap.pop() {
            match entry.target {
                Target::Node(node) => match &node.entries {
                    Entries::Leaf(objects) => {
                        for object in objects {
                            let joined = self.feature.cjoin(&object.0.label, &query.label);
                            heap.push(SearchEntry {
                                dist: joined.cost - object.0.cost - query.cost,
                                joined,
                                target: Target::Object(object),
                            });
                        }
                    }
                    Entries::Inner(children) => {
                        for child in children {
                            let joined =
                                self.feature.cjoin(&child.bounding_box.label, &query.label);
                            heap.push(SearchEntry {
                                dist: joined.cost - child.bounding_box.cost - query.cost,
                                joined,
                                target: Target::Node(child),
                            });
                        }
                    }
                },
                Target::Object((key, value)) => {
                    result.push(Neighbor {
                        dist: entry.dist,
                        joined: entry.joined,
                        key: key.clone(),
                        value: value.clone(),
                    });
                    if result.len() >= k {
                        break;
                    }
                }
            }
        }

        result
    }
}

impl<'f, F: Feature, V: Send> RTreeIndex<'f, F, V> {
    /// Like [`remove_subset`](Self::remove_subset), with sibling descents
    /// fanned out over the worker pool. Each node compacts its children and
    /// recomputes its bounding box only after all of their descents joined.
    pub fn remove_subset_par(&mut self, query: &CostLabel<F::Label>) -> Vec<V> {
        let removed = Mutex::new(Vec::new());
        if self.root.size() > 0 {
            Self::remove_subset_under_par(self.feature, &mut self.root, query, &removed);
            if self.root.size() == 0 {
                self.reset_root();
            }
        }
        removed.into_inner()
    }

    fn remove_subset_under_par(
        feature: &F,
        node: &mut RTreeNode<F::Label, V>,
        query: &CostLabel<F::Label>,
        removed: &Mutex<Vec<V>>,
    ) {
        if feature.subset(&node.bounding_box.label, &query.label) {
            let mut values = Vec::new();
            Self::drain_values(node, &mut values);
            removed.lock().extend(values);
            return;
        }

        match &mut node.entries {
            Entries::Leaf(objects) => {
                let mut dropped = Vec::new();
                for (key, value) in std::mem::take(objects) {
                    if feature.subset(&key.label, &query.label) {
                        dropped.push(value);
                    } else {
                        objects.push((key, value));
                    }
                }
                if !dropped.is_empty() {
                    removed.lock().extend(dropped);
                }
            }
            Entries::Inner(children) => {
                children.par_iter_mut().for_each(|child| {
                    if feature.meet(&child.bounding_box.label, &query.label).is_some() {
                        Self::remove_subset_under_par(feature, child, query, removed);
                    }
                });
                children.retain(|c| c.size() > 0);
            }
        }

        Self::recompute_bounding_box(feature, node);
    }
}

enum Target<'a, L, V> {
    Node(&'a RTreeNode<L, V>),
    Object(&'a (CostLabel<L>, V)),
}

struct SearchEntry<'a, L, V> {
    dist: Cost,
    joined: CostLabel<L>,
    target: Target<'a, L, V>,
}

impl<L, V> PartialEq for SearchEntry<'_, L, V> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<L, V> Eq for SearchEntry<'_, L, V> {}

impl<L, V> PartialOrd for SearchEntry<'_, L, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<L, V> Ord for SearchEntry<'_, L, V> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so that the max-heap pops the closest entry first.
        cmp_by_distance(other.dist, other.joined.cost, self.dist, self.joined.cost)
    }
}
