//! Transitive grouping of matched entities.

use std::collections::BTreeMap;

/// A group of nodes that all belong to one real-world fact.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster<T> {
    /// In the order they were first added.
    pub members: Vec<T>,
    /// Weakest link that joined the cluster; `None` for singletons.
    pub min_link_score: Option<f64>,
}

impl<T> Cluster<T> {
    /// Returns true if nothing matched this member.
    #[must_use]
    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }
}

/// Union-find over match links.
///
/// If A matches B and B matches C, A, B and C end up in one cluster even
/// when A and C would not match directly.
#[derive(Debug, Clone)]
pub struct ClusterBuilder<T: Ord + Copy> {
    parent: BTreeMap<T, T>,
    min_link: BTreeMap<T, f64>,
    order: Vec<T>,
}

impl<T: Ord + Copy> Default for ClusterBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Copy> ClusterBuilder<T> {
    /// An empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parent: BTreeMap::new(),
            min_link: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    /// Adds a node with no links. Adding twice is a no-op.
    pub fn add(&mut self, node: T) {
        if !self.parent.contains_key(&node) {
            self.parent.insert(node, node);
            self.order.push(node);
        }
    }

    fn find(&mut self, node: T) -> T {
        let mut root = node;
        while let Some(&p) = self.parent.get(&root) {
            if p == root {
                break;
            }
            root = p;
        }
        // Path compression.
        let mut current = node;
        while current != root {
            let next = self.parent.get(&current).copied().unwrap_or(root);
            self.parent.insert(current, root);
            current = next;
        }
        root
    }

    /// Records that `a` and `b` match with `score`, adding them if needed.
    pub fn link(&mut self, a: T, b: T, score: f64) {
        self.add(a);
        self.add(b);
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let joined = [self.min_link.remove(&ra), self.min_link.remove(&rb), Some(score)]
            .into_iter()
            .flatten()
            .fold(f64::INFINITY, f64::min);
        // Lower node becomes the root so results do not depend on link order.
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent.insert(child, root);
        self.min_link.insert(root, joined);
    }

    /// Returns true if `a` and `b` are in the same cluster.
    pub fn connected(&mut self, a: T, b: T) -> bool {
        self.parent.contains_key(&a) && self.parent.contains_key(&b) && self.find(a) == self.find(b)
    }

    /// Produces the clusters, ordered by their earliest-added member.
    #[must_use]
    pub fn build(mut self) -> Vec<Cluster<T>> {
        let mut by_root: BTreeMap<T, usize> = BTreeMap::new();
        let mut out: Vec<Cluster<T>> = Vec::new();
        for node in std::mem::take(&mut self.order) {
            let root = self.find(node);
            match by_root.get(&root) {
                Some(&idx) => out[idx].members.push(node),
                None => {
                    by_root.insert(root, out.len());
                    out.push(Cluster {
                        members: vec![node],
                        min_link_score: self.min_link.get(&root).copied(),
                    });
                }
            }
        }
        out
    }
}
