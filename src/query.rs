use hashbrown::HashMap;

use crate::dictionary::StringDictionary;
use crate::RelId;

/// One feature record of a query.
#[derive(Clone, Debug)]
pub enum FeatureRecord {
    /// A typed binary relation between two nodes.
    Relation {
        /// Index of the left node.
        a: usize,
        /// Index of the right node.
        b: usize,
        /// Name of the relation type.
        rel: String,
    },

    /// An all-different constraint: the listed nodes must not share an
    /// inferred label.
    Scope {
        /// Indices of the constrained nodes.
        nodes: Vec<usize>,
    },

    /// A factor over a group of nodes, scored by the multiset of their
    /// labels.
    Group {
        /// Indices of the member nodes, multiplicity preserved.
        nodes: Vec<usize>,
    },
}

/// The initial state of one node in a request or training record.
#[derive(Clone, Debug)]
pub struct NodeInit {
    /// Node index.
    pub node: usize,
    /// Label name.
    pub label: String,
    /// Whether the label is given (immutable) rather than to be inferred.
    pub given: bool,
}

/// One training record: a feature query plus its reference labeling.
#[derive(Clone, Debug)]
pub struct TrainingQuery {
    /// The query's feature records.
    pub features: Vec<FeatureRecord>,
    /// The reference node labeling.
    pub assignments: Vec<NodeInit>,
}

/// A typed arc between two nodes of a query graph.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) struct GraphArc {
    pub(crate) node_a: usize,
    pub(crate) node_b: usize,
    pub(crate) rel: RelId,
}

/// The per-request graph: arcs, scopes and factor groups with the incidence
/// tables inference iterates over.
///
/// Node indices are contiguous from 0 to the maximum index mentioned by any
/// feature. Relation types are resolved against the dictionary without
/// inserting; an arc whose relation is unknown is dropped (it cannot carry
/// weight), though its node indices still extend the graph.
pub struct GraphQuery {
    pub(crate) arcs: Vec<GraphArc>,
    pub(crate) factors: Vec<Vec<usize>>,
    pub(crate) arcs_adjacent: Vec<Vec<GraphArc>>,
    pub(crate) arcs_between: HashMap<(usize, usize), Vec<GraphArc>>,
    pub(crate) scopes: Vec<Vec<usize>>,
    pub(crate) scopes_of_node: Vec<Vec<usize>>,
    pub(crate) factors_of_node: Vec<Vec<usize>>,
}

impl GraphQuery {
    pub(crate) fn build(
        records: &[FeatureRecord],
        dict: &StringDictionary,
        use_factors: bool,
    ) -> Self {
        let mut arcs = vec![];
        let mut scopes: Vec<Vec<usize>> = vec![];
        let mut factors: Vec<Vec<usize>> = vec![];
        let mut max_index = 0;

        for record in records {
            match record {
                FeatureRecord::Relation { a, b, rel } => {
                    max_index = max_index.max(*a).max(*b);
                    let Some(rel) = dict.find(rel) else { continue };
                    arcs.push(GraphArc {
                        node_a: *a,
                        node_b: *b,
                        rel,
                    });
                }
                FeatureRecord::Scope { nodes } => {
                    if nodes.is_empty() {
                        continue;
                    }
                    let mut scope = nodes.clone();
                    scope.sort_unstable();
                    max_index = max_index.max(*scope.last().unwrap());
                    scope.dedup();
                    scopes.push(scope);
                }
                FeatureRecord::Group { nodes } => {
                    if !use_factors || nodes.is_empty() {
                        continue;
                    }
                    let mut group = nodes.clone();
                    group.sort_unstable();
                    max_index = max_index.max(*group.last().unwrap());
                    factors.push(group);
                }
            }
        }
        arcs.sort_unstable();

        let node_count = max_index + 1;
        let mut arcs_adjacent = vec![vec![]; node_count];
        for &arc in &arcs {
            arcs_adjacent[arc.node_a].push(arc);
            arcs_adjacent[arc.node_b].push(arc);
        }
        for adjacent in &mut arcs_adjacent {
            adjacent.sort_unstable();
            adjacent.dedup();
        }

        let mut arcs_between: HashMap<(usize, usize), Vec<GraphArc>> = HashMap::new();
        for &arc in &arcs {
            arcs_between
                .entry((arc.node_a, arc.node_b))
                .or_default()
                .push(arc);
            arcs_between
                .entry((arc.node_b, arc.node_a))
                .or_default()
                .push(arc);
        }

        let mut scopes_of_node = vec![vec![]; node_count];
        for (scope, nodes) in scopes.iter().enumerate() {
            for &node in nodes {
                scopes_of_node[node].push(scope);
            }
        }

        let mut factors_of_node = vec![vec![]; node_count];
        for (i, factor) in factors.iter().enumerate() {
            for &node in factor {
                factors_of_node[node].push(i);
            }
        }

        Self {
            arcs,
            factors,
            arcs_adjacent,
            arcs_between,
            scopes,
            scopes_of_node,
            factors_of_node,
        }
    }

    /// Returns the number of nodes, one past the maximum index any feature
    /// mentions.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.arcs_adjacent.len()
    }

    pub(crate) fn arcs_between(&self, node_a: usize, node_b: usize) -> &[GraphArc] {
        self.arcs_between
            .get(&(node_a, node_b))
            .map_or(&[], Vec::as_slice)
    }
}
