use crate::*;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use ordered_float::NotNan;
use rustc_hash::FxHashMap;

pub type LabelId = usize;

#[derive(Debug)]
pub struct LabelInfo {
    pub cost: Cost,
    pub parents: Vec<LabelId>,
    pub children: Vec<LabelId>,
}

/// The DAG of named device labels, each with a declared cost and zero or
/// more parents. Exactly one label has no parents; it is the top of the
/// label lattice. The hierarchy is immutable once parsed.
pub struct LabelHierarchy {
    labels: IndexMap<String, LabelInfo>,
    top: LabelId,
    stamp: u64,
}

static STAMP: AtomicU64 = AtomicU64::new(0);

// Reachability sets and join/meet results are memoized per thread so that
// concurrent workers never contend on a shared cache. The per-hierarchy
// stamp keys the caches, since distinct hierarchies reuse label ids.
thread_local! {
    static PREDECESSORS: RefCell<FxHashMap<(u64, LabelId), Rc<BTreeSet<LabelId>>>> =
        RefCell::new(FxHashMap::default());
    static SUCCESSORS: RefCell<FxHashMap<(u64, LabelId), Rc<BTreeSet<LabelId>>>> =
        RefCell::new(FxHashMap::default());
    static JOINS: RefCell<FxHashMap<(u64, LabelId, LabelId), LabelId>> =
        RefCell::new(FxHashMap::default());
    static MEETS: RefCell<FxHashMap<(u64, LabelId, LabelId), Option<LabelId>>> =
        RefCell::new(FxHashMap::default());
}

impl FromStr for LabelHierarchy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        let mut labels = IndexMap::<String, LabelInfo>::new();

        // Format of each line: <name> <cost> <parent_name>*
        // A label's parents must appear on earlier lines.
        for (i, line) in s.lines().enumerate() {
            let i = i + 1;
            let mut parts = line.split_whitespace();
            let name = parts
                .next()
                .ok_or_else(|| format!("missing label name on line {i}"))?;
            let cost_str = parts
                .next()
                .ok_or_else(|| format!("missing cost for '{name}' on line {i}"))?;
            let cost: f64 = cost_str
                .parse()
                .map_err(|e| format!("invalid cost on line {i} '{cost_str}': {e}"))?;
            let cost =
                NotNan::new(cost).map_err(|_| format!("cost on line {i} is not a number"))?;

            let mut parents = Vec::new();
            for parent in parts {
                let id = labels
                    .get_index_of(parent)
                    .ok_or_else(|| format!("unknown parent '{parent}' of '{name}' on line {i}"))?;
                parents.push(id);
            }

            let info = LabelInfo {
                cost,
                parents,
                children: Vec::new(),
            };
            if labels.insert(name.to_owned(), info).is_some() {
                return Err(format!("duplicate label '{name}' on line {i}"));
            }
        }

        let mut top = None;
        let mut children: Vec<Vec<LabelId>> = vec![Vec::new(); labels.len()];
        for (id, (name, info)) in labels.iter().enumerate() {
            if info.parents.is_empty() {
                if let Some(first) = top {
                    let (first_name, _) = labels.get_index(first).unwrap();
                    return Err(format!("multiple roots: '{first_name}' and '{name}'"));
                }
                top = Some(id);
            }
            for &p in &info.parents {
                children[p].push(id);
            }
        }
        let top = top.ok_or_else(|| "hierarchy has no root".to_owned())?;

        for (id, info) in labels.values_mut().enumerate() {
            info.children = std::mem::take(&mut children[id]);
        }

        Ok(LabelHierarchy {
            labels,
            top,
            stamp: STAMP.fetch_add(1, Ordering::Relaxed),
        })
    }
}

impl LabelHierarchy {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn top(&self) -> LabelId {
        self.top
    }

    fn info(&self, l: LabelId) -> &LabelInfo {
        self.labels.get_index(l).unwrap().1
    }

    pub fn cost(&self, l: LabelId) -> Cost {
        self.info(l).cost
    }

    pub fn id_to_name(&self, l: LabelId) -> &str {
        self.labels.get_index(l).unwrap().0
    }

    pub fn name_to_id(&self, name: &str) -> Option<LabelId> {
        self.labels.get_index_of(name)
    }

    /// The label itself plus every ancestor reachable through parent links.
    pub fn predecessors(&self, l: LabelId) -> Rc<BTreeSet<LabelId>> {
        PREDECESSORS.with(|cache| {
            if let Some(hit) = cache.borrow().get(&(self.stamp, l)) {
                return Rc::clone(hit);
            }
            let mut set = BTreeSet::new();
            self.add_parents(l, &mut set);
            let set = Rc::new(set);
            cache.borrow_mut().insert((self.stamp, l), Rc::clone(&set));
            set
        })
    }

    /// The label itself plus every descendant reachable through child links.
    pub fn successors(&self, l: LabelId) -> Rc<BTreeSet<LabelId>> {
        SUCCESSORS.with(|cache| {
            if let Some(hit) = cache.borrow().get(&(self.stamp, l)) {
                return Rc::clone(hit);
            }
            let mut set = BTreeSet::new();
            self.add_children(l, &mut set);
            let set = Rc::new(set);
            cache.borrow_mut().insert((self.stamp, l), Rc::clone(&set));
            set
        })
    }

    fn add_parents(&self, l: LabelId, acc: &mut BTreeSet<LabelId>) {
        if acc.insert(l) {
            for &p in &self.info(l).parents {
                self.add_parents(p, acc);
            }
        }
    }

    fn add_children(&self, l: LabelId, acc: &mut BTreeSet<LabelId>) {
        if acc.insert(l) {
            for &c in &self.info(l).children {
                self.add_children(c, acc);
            }
        }
    }

    /// The cheapest common ancestor of the two labels.
    pub fn join(&self, l1: LabelId, l2: LabelId) -> LabelId {
        if let Some(hit) = JOINS.with(|c| c.borrow().get(&(self.stamp, l1, l2)).copied()) {
            return hit;
        }

        let p1 = self.predecessors(l1);
        let p2 = self.predecessors(l2);

        let mut best: Option<LabelId> = None;
        for &l in p1.intersection(&p2) {
            match best {
                None => best = Some(l),
                Some(b) => {
                    if self.cost(l) < self.cost(b) {
                        best = Some(l);
                    } else if within_tolerance(self.cost(l), self.cost(b))
                        && self.predecessors(l).contains(&b)
                    {
                        // An ancestor chain with equal costs collapses
                        // toward the most specific member.
                        best = Some(l);
                    }
                }
            }
        }
        let best = best.expect("labels share no common ancestor");

        JOINS.with(|c| c.borrow_mut().insert((self.stamp, l1, l2), best));
        best
    }

    /// The costliest common descendant, or `None` if the labels are disjoint.
    pub fn meet(&self, l1: LabelId, l2: LabelId) -> Option<LabelId> {
        if let Some(hit) = MEETS.with(|c| c.borrow().get(&(self.stamp, l1, l2)).copied()) {
            return hit;
        }

        let s1 = self.successors(l1);
        let s2 = self.successors(l2);

        let mut best: Option<LabelId> = None;
        for &l in s1.intersection(&s2) {
            match best {
                None => best = Some(l),
                Some(b) => {
                    if self.cost(l) > self.cost(b) {
                        best = Some(l);
                    } else if within_tolerance(self.cost(l), self.cost(b))
                        && self.successors(l).contains(&b)
                    {
                        best = Some(l);
                    }
                }
            }
        }

        MEETS.with(|c| c.borrow_mut().insert((self.stamp, l1, l2), best));
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Any
    // |-- User -- u1, u2
    // `-- Server -- s1
    const SMALL: &str = "Any 10\n\
                         User 2 Any\n\
                         Server 2 Any\n\
                         u1 1 User\n\
                         u2 1 User\n\
                         s1 1 Server\n";

    fn small() -> LabelHierarchy {
        SMALL.parse().unwrap()
    }

    #[test]
    fn loads_and_resolves_names() {
        let h = small();
        assert_eq!(h.len(), 6);
        assert!(!h.is_empty());
        assert_eq!(h.id_to_name(h.top()), "Any");
        let user = h.name_to_id("User").unwrap();
        assert_eq!(h.id_to_name(user), "User");
        assert_eq!(h.cost(user).into_inner(), 2.0);
        assert_eq!(h.name_to_id("nope"), None);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("".parse::<LabelHierarchy>().is_err());
        assert!("Any".parse::<LabelHierarchy>().is_err());
        assert!("Any ten".parse::<LabelHierarchy>().is_err());
        assert!("Any 1\nAny 2".parse::<LabelHierarchy>().is_err());
        assert!("Any 1\nu1 1 Missing".parse::<LabelHierarchy>().is_err());
        // Two parentless labels.
        assert!("Any 1\nOther 1".parse::<LabelHierarchy>().is_err());
        // A label referencing a later line never resolves.
        assert!("u1 1 User\nUser 2".parse::<LabelHierarchy>().is_err());
    }

    #[test]
    fn reachability_sets() {
        let h = small();
        let ids = |names: &[&str]| -> BTreeSet<LabelId> {
            names.iter().map(|n| h.name_to_id(n).unwrap()).collect()
        };
        let u1 = h.name_to_id("u1").unwrap();
        let user = h.name_to_id("User").unwrap();
        assert_eq!(*h.predecessors(u1), ids(&["u1", "User", "Any"]));
        assert_eq!(*h.successors(user), ids(&["User", "u1", "u2"]));
        assert_eq!(*h.predecessors(h.top()), ids(&["Any"]));
        assert_eq!(
            *h.successors(h.top()),
            ids(&["Any", "User", "Server", "u1", "u2", "s1"])
        );
    }

    #[test]
    fn join_picks_cheapest_common_ancestor() {
        let h = small();
        let id = |n: &str| h.name_to_id(n).unwrap();
        assert_eq!(h.join(id("u1"), id("u2")), id("User"));
        assert_eq!(h.join(id("u1"), id("s1")), id("Any"));
        assert_eq!(h.join(id("User"), id("s1")), id("Any"));
        assert_eq!(h.join(id("u1"), id("u1")), id("u1"));
        assert_eq!(h.join(id("u1"), id("User")), id("User"));
    }

    #[test]
    fn meet_picks_costliest_common_descendant() {
        let h = small();
        let id = |n: &str| h.name_to_id(n).unwrap();
        assert_eq!(h.meet(id("User"), id("Server")), None);
        assert_eq!(h.meet(id("u1"), id("u2")), None);
        assert_eq!(h.meet(id("User"), id("u1")), Some(id("u1")));
        assert_eq!(h.meet(h.top(), id("Server")), Some(id("Server")));
        assert_eq!(h.meet(id("u1"), id("u1")), Some(id("u1")));
    }

    #[test]
    fn equal_cost_ancestors_prefer_the_descendant() {
        // Wide and Narrow have the same cost; Narrow sits below Wide, so a
        // join reaching both must settle on Narrow.
        let h: LabelHierarchy = "Top 100\n\
                                 Wide 10 Top\n\
                                 Narrow 10 Wide\n\
                                 a 1 Narrow\n\
                                 b 1 Narrow\n"
            .parse()
            .unwrap();
        let id = |n: &str| h.name_to_id(n).unwrap();
        assert_eq!(h.join(id("a"), id("b")), id("Narrow"));
        // Mirrored rule for meet: the ancestor wins.
        assert_eq!(h.meet(id("Wide"), id("Narrow")), Some(id("Narrow")));
    }

    #[test]
    fn diamond_is_a_dag_not_a_tree() {
        let h: LabelHierarchy = "Any 100\n\
                                 Left 10 Any\n\
                                 Right 20 Any\n\
                                 shared 1 Left Right\n\
                                 l2 1 Left\n"
            .parse()
            .unwrap();
        let id = |n: &str| h.name_to_id(n).unwrap();
        // The shared child reaches the top through both parents.
        assert!(h.predecessors(id("shared")).contains(&id("Left")));
        assert!(h.predecessors(id("shared")).contains(&id("Right")));
        // Left is the cheapest label covering both of its children.
        assert_eq!(h.join(id("shared"), id("l2")), id("Left"));
        assert_eq!(h.meet(id("Left"), id("Right")), Some(id("shared")));
    }
}
