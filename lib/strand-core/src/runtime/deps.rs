/// Dependencies between the children of a supervisor.
///
/// `depends_on[i][j]` is set when child `i` depends on child `j`. When no edge has been added explicitly, children are
/// treated as a chain in registration order: child `i` depends on child `i - 1`.
#[derive(Debug, Default)]
pub(super) struct DependencyGraph {
    depends_on: Vec<Vec<bool>>,
    explicit: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum EdgeError {
    OutOfBounds,
    Cycle,
}

impl DependencyGraph {
    pub fn add_node(&mut self) {
        for row in &mut self.depends_on {
            row.push(false);
        }
        let len = self.depends_on.len() + 1;
        self.depends_on.push(vec![false; len]);
    }

    pub fn len(&self) -> usize {
        self.depends_on.len()
    }

    /// Records that `child` depends on `depends_on`.
    ///
    /// Edges that would create a cycle, including self-edges, are rejected.
    pub fn add_edge(&mut self, child: usize, depends_on: usize) -> Result<(), EdgeError> {
        if child >= self.len() || depends_on >= self.len() {
            return Err(EdgeError::OutOfBounds);
        }
        if child == depends_on || self.reaches(depends_on, child) {
            return Err(EdgeError::Cycle);
        }

        self.depends_on[child][depends_on] = true;
        self.explicit = true;
        Ok(())
    }

    fn depends(&self, child: usize, on: usize) -> bool {
        if self.explicit {
            self.depends_on[child][on]
        } else {
            child == on + 1
        }
    }

    // Whether `from` transitively depends on `to` through explicit edges. Explicit edges replace the default chain, so
    // the chain never takes part in cycle detection.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut visited = vec![false; self.len()];
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if std::mem::replace(&mut visited[node], true) {
                continue;
            }
            stack.extend((0..self.len()).filter(|&next| self.depends_on[node][next]));
        }
        false
    }

    /// Returns `failed` followed by every child that transitively depends on it.
    ///
    /// Dependents are visited depth-first in ascending index order, and each child appears at most once.
    pub fn cascade(&self, failed: usize) -> Vec<usize> {
        let mut visited = vec![false; self.len()];
        let mut order = Vec::new();
        if failed < self.len() {
            self.visit(failed, &mut visited, &mut order);
        }
        order
    }

    fn visit(&self, node: usize, visited: &mut [bool], order: &mut Vec<usize>) {
        visited[node] = true;
        order.push(node);
        for dependent in 0..self.len() {
            if !visited[dependent] && self.depends(dependent, node) {
                self.visit(dependent, visited, order);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: usize) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        for _ in 0..nodes {
            graph.add_node();
        }
        graph
    }

    #[test]
    fn registration_order_chain_by_default() {
        let graph = graph(4);
        assert_eq!(graph.cascade(0), vec![0, 1, 2, 3]);
        assert_eq!(graph.cascade(2), vec![2, 3]);
        assert_eq!(graph.cascade(3), vec![3]);
    }

    #[test]
    fn explicit_edges_cascade_depth_first() {
        // 1 -> 0, 3 -> 0, 2 -> 1, 4 -> 2
        let mut graph = graph(5);
        graph.add_edge(1, 0).unwrap();
        graph.add_edge(3, 0).unwrap();
        graph.add_edge(2, 1).unwrap();
        graph.add_edge(4, 2).unwrap();

        assert_eq!(graph.cascade(0), vec![0, 1, 2, 4, 3]);
        assert_eq!(graph.cascade(3), vec![3]);
    }

    #[test]
    fn diamond_visits_each_child_once() {
        let mut graph = graph(4);
        graph.add_edge(1, 0).unwrap();
        graph.add_edge(2, 0).unwrap();
        graph.add_edge(3, 1).unwrap();
        graph.add_edge(3, 2).unwrap();

        assert_eq!(graph.cascade(0), vec![0, 1, 3, 2]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = graph(3);
        graph.add_edge(1, 0).unwrap();
        graph.add_edge(2, 1).unwrap();

        assert_eq!(graph.add_edge(0, 2), Err(EdgeError::Cycle));
        assert_eq!(graph.add_edge(1, 1), Err(EdgeError::Cycle));
        assert_eq!(graph.add_edge(3, 0), Err(EdgeError::OutOfBounds));
    }

    #[test]
    fn first_explicit_edge_ignores_default_chain() {
        let mut graph = graph(3);
        graph.add_edge(0, 2).unwrap();
        assert_eq!(graph.cascade(2), vec![2, 0]);
        assert_eq!(graph.cascade(1), vec![1]);
    }

    #[test]
    fn nodes_added_after_edges() {
        let mut graph = graph(2);
        graph.add_edge(1, 0).unwrap();
        graph.add_node();
        graph.add_edge(2, 1).unwrap();
        assert_eq!(graph.cascade(0), vec![0, 1, 2]);
    }
}
