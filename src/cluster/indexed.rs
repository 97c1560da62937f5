use super::*;

use std::collections::BinaryHeap;
use std::time::Instant;

use indexmap::IndexSet;
use log::{debug, info};
use parking_lot::Mutex;
use rayon::prelude::*;

/// Best-first agglomeration backed by the R-tree index: nearest neighbors
/// come from approximate kNN queries and subsumption from bulk subset
/// removal.
pub struct IndexedClusterer {
    pub parallel_init: bool,
    pub parallel_remove: bool,
}

impl Default for IndexedClusterer {
    fn default() -> Self {
        IndexedClusterer {
            parallel_init: true,
            parallel_remove: false,
        }
    }
}

/// The closest active peer of cluster `c`, or `None` when `c` is the only
/// indexed cluster. The first kNN hit is normally `c` itself; when a peer
/// ties the self-distance it may surface first instead, and is just as good
/// an answer.
fn nearest<F: Feature>(
    feature: &F,
    index: &RTreeIndex<F, usize>,
    clusters: &[CostLabel<F::Label>],
    c: usize,
) -> Option<MergeEntry<F::Label>> {
    let hits = index.get_knn_approx(&clusters[c], 2);
    let hit = match hits.as_slice() {
        [] => return None,
        [only] => {
            debug_assert_eq!(only.value, c);
            return None;
        }
        [first, second, ..] => {
            if first.value == c {
                second
            } else {
                debug!("nearest neighbor of {c} surfaced a tied peer before the cluster itself");
                first
            }
        }
    };
    let dist = cost_gain_distance(&clusters[c], &hit.key, &hit.joined);
    Some(MergeEntry {
        dist,
        joined: hit.joined.clone(),
        i: c,
        j: hit.value,
    })
}

impl<F: Feature> Clusterer<F> for IndexedClusterer {
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
        let mut index = RTreeIndex::new(feature);
        for (i, cluster) in clusters.iter().enumerate() {
            index.insert(cluster, i);
        }
        info!("indexed {} singleton clusters in {:.2?}", clusters.len(), timer.elapsed());

        let timer = Instant::now();
        let mut queue: BinaryHeap<MergeEntry<F::Label>> = if self.parallel_init {
            let queue = Mutex::new(BinaryHeap::new());
            (0..clusters.len()).into_par_iter().for_each(|i| {
                if let Some(entry) = nearest(feature, &index, &clusters, i) {
                    queue.lock().push(entry);
                }
            });
            queue.into_inner()
        } else {
            let mut queue = BinaryHeap::new();
            for i in 0..clusters.len() {
                if let Some(entry) = nearest(feature, &index, &clusters, i) {
                    queue.push(entry);
                }
            }
            queue
        };
        info!("seeded nearest neighbors in {:.2?}", timer.elapsed());

        while remaining.len() > k {
            // Drop stale entries until the top is a pair of active clusters,
            // re-seeding the survivor of any half-stale pair.
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
                    if let Some(entry) = nearest(feature, &index, &clusters, c) {
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

            let subsumed = if self.parallel_remove {
                index.remove_subset_par(&best.joined)
            } else {
                index.remove_subset(&best.joined)
            };
            for c in subsumed {
                debug!("subsumed {} into {}", c, new_id);
                parents[c] = new_id;
                remaining.shift_remove(&c);
            }
            debug_assert!(!remaining.contains(&best.i));
            debug_assert!(!remaining.contains(&best.j));

            remaining.insert(new_id);
            index.insert(&clusters[new_id], new_id);

            if remaining.len() > 1 {
                if let Some(entry) = nearest(feature, &index, &clusters, new_id) {
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
