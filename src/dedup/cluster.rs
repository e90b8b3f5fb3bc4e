use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::candidates::CandidatePair;

/// A connected component of the candidate graph, size >= 2
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCluster {
    pub entity_ids: BTreeSet<i64>,
    pub pairs: Vec<CandidatePair>,
}

impl DuplicateCluster {
    pub fn len(&self) -> usize {
        self.entity_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
    }
}

/// Disjoint-set forest over arbitrary entity ids
#[derive(Debug, Default)]
struct UnionFind {
    parent: HashMap<i64, i64>,
    rank: HashMap<i64, u32>,
}

impl UnionFind {
    fn find(&mut self, id: i64) -> i64 {
        let parent = *self.parent.entry(id).or_insert(id);
        if parent == id {
            return id;
        }
        let root = self.find(parent);
        self.parent.insert(id, root);
        root
    }

    fn union(&mut self, a: i64, b: i64) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return;
        }
        let rank_a = *self.rank.get(&root_a).unwrap_or(&0);
        let rank_b = *self.rank.get(&root_b).unwrap_or(&0);
        match rank_a.cmp(&rank_b) {
            std::cmp::Ordering::Less => {
                self.parent.insert(root_a, root_b);
            }
            std::cmp::Ordering::Greater => {
                self.parent.insert(root_b, root_a);
            }
            std::cmp::Ordering::Equal => {
                self.parent.insert(root_b, root_a);
                self.rank.insert(root_a, rank_a + 1);
            }
        }
    }
}

/// Connected components of the candidate graph.
///
/// Duplication is transitive: A~B and B~C put A, B and C in one cluster even
/// when A and C were never compared. Clusters are ordered by smallest member
/// id and each keeps its pairs in input order.
pub fn build_clusters(pairs: &[CandidatePair]) -> Vec<DuplicateCluster> {
    let mut forest = UnionFind::default();
    for pair in pairs {
        forest.union(pair.id_a, pair.id_b);
    }

    let mut components: BTreeMap<i64, DuplicateCluster> = BTreeMap::new();
    let mut root_to_min: HashMap<i64, i64> = HashMap::new();

    // Key components by their smallest member so output order is stable
    for pair in pairs {
        let root = forest.find(pair.id_a);
        let min_id = root_to_min.entry(root).or_insert(pair.id_a);
        *min_id = (*min_id).min(pair.id_a);
    }

    for pair in pairs {
        let root = forest.find(pair.id_a);
        let key = root_to_min[&root];
        let cluster = components.entry(key).or_insert_with(|| DuplicateCluster {
            entity_ids: BTreeSet::new(),
            pairs: Vec::new(),
        });
        cluster.entity_ids.insert(pair.id_a);
        cluster.entity_ids.insert(pair.id_b);
        cluster.pairs.push(pair.clone());
    }

    components
        .into_values()
        .filter(|cluster| cluster.len() >= 2)
        .collect()
}
