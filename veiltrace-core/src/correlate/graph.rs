use std::collections::HashMap;

/// Undirected weighted graph over flow ids, built from emitted correlation
/// pairs. The contract is narrow (edge insertion, neighbour lookup,
/// connected components), so a union-find plus adjacency list stands in
/// for a graph library.
#[derive(Debug, Default)]
pub struct CorrelationGraph {
    adjacency: HashMap<i64, Vec<(i64, f64)>>,
    parent: HashMap<i64, i64>,
}

impl CorrelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, a: i64, b: i64, weight: f64) {
        self.adjacency.entry(a).or_default().push((b, weight));
        self.adjacency.entry(b).or_default().push((a, weight));
        self.parent.entry(a).or_insert(a);
        self.parent.entry(b).or_insert(b);
        self.union(a, b);
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum::<usize>() / 2
    }

    /// Neighbours of `id` with edge weights, in ascending id order.
    pub fn neighbors(&self, id: i64) -> Vec<(i64, f64)> {
        let mut out = self
            .adjacency
            .get(&id)
            .cloned()
            .unwrap_or_default();
        out.sort_by_key(|(other, _)| *other);
        out
    }

    /// Connected components holding at least `min_size` flows: the
    /// candidate circuits. Components and their members are sorted so the
    /// output is deterministic.
    pub fn components(&mut self, min_size: usize) -> Vec<Vec<i64>> {
        let nodes: Vec<i64> = self.parent.keys().copied().collect();
        let mut groups: HashMap<i64, Vec<i64>> = HashMap::new();
        for node in nodes {
            let root = self.find(node);
            groups.entry(root).or_default().push(node);
        }

        let mut components: Vec<Vec<i64>> = groups
            .into_values()
            .filter(|members| members.len() >= min_size.max(1))
            .collect();
        for component in &mut components {
            component.sort_unstable();
        }
        components.sort_by_key(|c| c[0]);
        components
    }

    fn find(&mut self, mut x: i64) -> i64 {
        loop {
            let parent = self.parent[&x];
            if parent == x {
                return x;
            }
            // Path halving keeps lookups near-constant.
            let grandparent = self.parent[&parent];
            self.parent.insert(x, grandparent);
            x = grandparent;
        }
    }

    fn union(&mut self, a: i64, b: i64) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            self.parent.insert(root_a, root_b);
        }
    }
}
