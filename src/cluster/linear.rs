use super::*;

use std::collections::BinaryHeap;
use std::time::Instant;

use indexmap::IndexSet;
use log::{debug, info};
use parking_lot::Mutex;
use rayon::prelude::*;

/// Index-free agglomeration: nearest neighbors by linear scan over the
/// active clusters, subsumption by a linear subset filter. Produces the
/// same dendrogram as [`IndexedClusterer`] whenever tie-breaks are
/// unambiguous.
pub struct LinearClusterer {
    pub parallel_init: bool,
}

impl Default for LinearClusterer {
    fn default() -> Self {
        LinearClusterer {
            parallel_init: true,
        }
    }
}

fn nearest<F: Feature>(
    feature: &F,
    clusters: &[CostLabel<F::Label>],
    remaining: &IndexSet<usize>,
    c: usize,
) -> Option<MergeEntry<F::Label>> {
    let mut best: Option<MergeEntry<F::Label>> = None;
    for &cc in remaining {
        if cc == c {
            continue;
        }
        let joined = feature.cjoin(&clusters[c].label, &clusters[cc].label);
        let dist = cost_gain_distance(&clusters[c], &clusters[cc], &joined);
        let better = match &best {
            None => true,
            Some(b) => {
                dist < b.dist || (within_tolerance(dist, b.dist) && joined.cost < b.joined.cost)
            }
        };
        if better {
            best = Some(MergeEntry {
                dist,
                joined,
                i: c,
                j: cc,
            });
        }
    }
    best
}

impl<F: Feature> Clusterer<F> for LinearClusterer {
    fn cluster(&self, feature: &F, flows: &[F::Label], k: usize) -> Dendrogram<F::Label> {
        let k = if k == 0 { flows.len() } else { k };
        let overall = Instant::now();

        let mut clusters: Vec<CostLabel<F::Label>> = Vec::with_capacity(2 * flows.len());
        let mut parents: Vec<usize> = Vec::with_capacity(2 * flows.len());
        let mut remaining: IndexSet<usize> = IndexSet::default();
        for (i, flow) in flows.iter().enumerate() {
            clusters.push(feature.cjoin(flow, flow));
            parents.push(i);
            remaining.insert(i);
        }

        let timer = Instant::now();
        let mut queue: BinaryHeap<MergeEntry<F::Label>> = if self.parallel_init {
            let queue = Mutex::new(BinaryHeap::new());
            (0..clusters.len()).into_par_iter().for_each(|i| {
                if let Some(entry) = nearest(feature, &clusters, &remaining, i) {
                    queue.lock().push(entry);
                }
            });
            queue.into_inner()
        } else {
            let mut queue = BinaryHeap::new();
            for i in 0..clusters.len() {
                if let Some(entry) = nearest(feature, &clusters, &remaining, i) {
                    queue.push(entry);
                }
            }
            queue
        };
        info!("seeded nearest neighbors in {:.2?}", timer.elapsed());

        while remaining.len() > k {
            loop {
                let survivor = match queue.peek() {
                    None => break,
                    Some(top) if remaining.contains(&top.i) && remaining.contains(&top.j) => break,
                    Some(top) if remaining.contains(&top.i) => Some(top.i),
                    Some(top) if remaining.contains(&top.j) => Some(top.j),
                    Some(_) => None,
                };
                queue.pop();
                if let Some(c) = survivor {
                    if let Some(entry) = nearest(feature, &clusters, &remaining, c) {
                        queue.push(entry);
                    }
                }
            }

            let best = queue.pop().expect("merge queue drained with clusters remaining");

            let new_id = clusters.len();
            debug!(
                "merge {} <- {} u {} at distance {}",
                new_id, best.i, best.j, best.dist
            );
            clusters.push(best.joined.clone());
            parents.push(new_id);

            let subsumed: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&c| feature.subset(&clusters[c].label, &best.joined.label))
                .collect();
            for c in subsumed {
                debug!("subsumed {} into {}", c, new_id);
                parents[c] = new_id;
                remaining.shift_remove(&c);
            }
            debug_assert!(!remaining.contains(&best.i));
            debug_assert!(!remaining.contains(&best.j));

            remaining.insert(new_id);

            if remaining.len() > 1 {
                if let Some(entry) = nearest(feature, &clusters, &remaining, new_id) {
                    queue.push(entry);
                }
            }
        }

        info!(
            "clustered {} flows down to {} in {:.2?}",
            flows.len(),
            remaining.len(),
            overall.elapsed()
        );
        Dendrogram::from_parts(clusters, parents)
    }
}
