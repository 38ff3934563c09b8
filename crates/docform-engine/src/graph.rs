use docform_model::FieldId;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

/// A directed "depends on" graph over fields with a precomputed evaluation order.
///
/// The graph is immutable once built; registration code rebuilds it from scratch, so a rejected
/// edge set never leaves a half-updated graph behind.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: BTreeMap<FieldId, BTreeSet<FieldId>>,
    dependents: BTreeMap<FieldId, BTreeSet<FieldId>>,
    order: Vec<FieldId>,
    position: HashMap<FieldId, usize>,
}

/// The graph contains a cycle. `path` follows depends-on edges and repeats its first node at the
/// end, e.g. `a -> b -> a`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub path: Vec<FieldId>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circular dependency: ")?;
        for (idx, node) in self.path.iter().enumerate() {
            if idx > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{node}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CycleError {}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from `(node, dependencies)` pairs.
    ///
    /// Dependencies that are not listed as nodes themselves become leaf nodes.
    pub fn build<I, D>(nodes: I) -> Result<Self, CycleError>
    where
        I: IntoIterator<Item = (FieldId, D)>,
        D: IntoIterator<Item = FieldId>,
    {
        let mut dependencies: BTreeMap<FieldId, BTreeSet<FieldId>> = BTreeMap::new();
        let mut dependents: BTreeMap<FieldId, BTreeSet<FieldId>> = BTreeMap::new();

        for (node, deps) in nodes {
            dependents.entry(node.clone()).or_default();
            let entry = dependencies.entry(node.clone()).or_default();
            for dep in deps {
                dependents.entry(dep.clone()).or_default().insert(node.clone());
                entry.insert(dep);
            }
        }
        for node in dependents.keys() {
            if !dependencies.contains_key(node) {
                dependencies.insert(node.clone(), BTreeSet::new());
            }
        }

        let order = topo_sort(&dependencies, &dependents)?;
        let position = order
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx))
            .collect();

        Ok(Self {
            dependencies,
            dependents,
            order,
            position,
        })
    }

    pub fn contains(&self, field: &str) -> bool {
        self.position.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Every node exactly once, each after all of its dependencies. Ties are broken by lexical
    /// field id order, so the order is stable across runs.
    pub fn topo_order(&self) -> &[FieldId] {
        &self.order
    }

    /// Index of `field` in [`topo_order`](Self::topo_order).
    pub fn position(&self, field: &str) -> Option<usize> {
        self.position.get(field).copied()
    }

    /// Direct dependencies of `field`, sorted.
    pub fn dependencies_of(&self, field: &str) -> Vec<FieldId> {
        self.dependencies
            .get(field)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `field`, sorted.
    pub fn dependents_of(&self, field: &str) -> Vec<FieldId> {
        self.dependents
            .get(field)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Transitive dependents of `field` in evaluation order. `field` itself is not included.
    pub fn affected_by(&self, field: &str) -> Vec<FieldId> {
        self.affected_by_all(std::iter::once(field))
    }

    /// Union of [`affected_by`](Self::affected_by) over several roots. Roots are included only
    /// when they are downstream of another root.
    pub fn affected_by_all<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> Vec<FieldId> {
        let mut seen: HashSet<&FieldId> = HashSet::new();
        let mut queue: VecDeque<&str> = roots.into_iter().collect();

        while let Some(current) = queue.pop_front() {
            let Some(dependents) = self.dependents.get(current) else {
                continue;
            };
            for dep in dependents {
                if seen.insert(dep) {
                    queue.push_back(dep.as_str());
                }
            }
        }

        let mut out: Vec<FieldId> = seen.into_iter().cloned().collect();
        self.sort_topologically(&mut out);
        out
    }

    /// Sorts `fields` by evaluation order; unknown fields go last, lexically.
    pub fn sort_topologically(&self, fields: &mut [FieldId]) {
        fields.sort_by(|a, b| {
            let pa = self.position(a.as_str()).unwrap_or(usize::MAX);
            let pb = self.position(b.as_str()).unwrap_or(usize::MAX);
            pa.cmp(&pb).then_with(|| a.cmp(b))
        });
    }
}

fn topo_sort(
    dependencies: &BTreeMap<FieldId, BTreeSet<FieldId>>,
    dependents: &BTreeMap<FieldId, BTreeSet<FieldId>>,
) -> Result<Vec<FieldId>, CycleError> {
    let mut in_degree: HashMap<&FieldId, usize> = dependencies
        .iter()
        .map(|(node, deps)| (node, deps.len()))
        .collect();

    let mut ready: BTreeSet<&FieldId> = in_degree
        .iter()
        .filter_map(|(&node, &deg)| (deg == 0).then_some(node))
        .collect();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(node) = ready.pop_first() {
        order.push(node.clone());
        let Some(next) = dependents.get(node) else {
            continue;
        };
        for dep in next {
            if let Some(deg) = in_degree.get_mut(dep) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    ready.insert(dep);
                }
            }
        }
    }

    if order.len() != dependencies.len() {
        let remaining: BTreeSet<&FieldId> = in_degree
            .into_iter()
            .filter_map(|(node, deg)| (deg > 0).then_some(node))
            .collect();
        let path = find_cycle(dependencies, &remaining).unwrap_or_default();
        return Err(CycleError { path });
    }

    Ok(order)
}

fn find_cycle<'g>(
    dependencies: &'g BTreeMap<FieldId, BTreeSet<FieldId>>,
    remaining: &BTreeSet<&'g FieldId>,
) -> Option<Vec<FieldId>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    struct Frame<'g> {
        node: &'g FieldId,
        neighbors: Vec<&'g FieldId>,
        idx: usize,
    }

    let neighbors = |node: &FieldId| -> Vec<&'g FieldId> {
        dependencies
            .get(node)
            .map(|deps| deps.iter().filter(|d| remaining.contains(d)).collect())
            .unwrap_or_default()
    };

    let mut color: HashMap<&'g FieldId, Color> =
        remaining.iter().map(|&node| (node, Color::White)).collect();
    let mut stack: Vec<&'g FieldId> = Vec::new();
    let mut pos_in_stack: HashMap<&'g FieldId, usize> = HashMap::new();

    for &start in remaining {
        if color.get(start) != Some(&Color::White) {
            continue;
        }

        let mut frames = vec![Frame {
            node: start,
            neighbors: neighbors(start),
            idx: 0,
        }];
        stack.push(start);
        pos_in_stack.insert(start, 0);
        color.insert(start, Color::Gray);

        while let Some(frame) = frames.last_mut() {
            if frame.idx >= frame.neighbors.len() {
                color.insert(frame.node, Color::Black);
                pos_in_stack.remove(frame.node);
                stack.pop();
                frames.pop();
                continue;
            }

            let next = frame.neighbors[frame.idx];
            frame.idx += 1;

            match color.get(next).copied().unwrap_or(Color::Black) {
                Color::White => {
                    color.insert(next, Color::Gray);
                    stack.push(next);
                    pos_in_stack.insert(next, stack.len() - 1);
                    frames.push(Frame {
                        node: next,
                        neighbors: neighbors(next),
                        idx: 0,
                    });
                }
                Color::Gray => {
                    let start_idx = pos_in_stack.get(next).copied().unwrap_or(0);
                    let mut cycle: Vec<FieldId> =
                        stack[start_idx..].iter().map(|&id| id.clone()).collect();
                    cycle.push(next.clone());
                    return Some(cycle);
                }
                Color::Black => {}
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(items: &[&str]) -> Vec<FieldId> {
        items.iter().map(|s| FieldId::from(*s)).collect()
    }

    fn graph(edges: &[(&str, &[&str])]) -> Result<DependencyGraph, CycleError> {
        DependencyGraph::build(
            edges
                .iter()
                .map(|(node, deps)| (FieldId::from(*node), ids(deps))),
        )
    }

    #[test]
    fn topo_order_places_dependencies_first_and_breaks_ties_lexically() {
        let g = graph(&[
            ("total", &["price", "qty"]),
            ("tax", &["total"]),
            ("qty", &[]),
            ("price", &[]),
            ("note", &[]),
        ])
        .unwrap();
        assert_eq!(
            g.topo_order(),
            ids(&["note", "price", "qty", "total", "tax"]).as_slice()
        );
    }

    #[test]
    fn affected_by_is_the_downstream_closure_in_order() {
        let g = graph(&[
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &["a", "c"]),
            ("e", &[]),
        ])
        .unwrap();
        assert_eq!(g.affected_by("a"), ids(&["b", "c", "d"]));
        assert_eq!(g.affected_by("c"), ids(&["d"]));
        assert!(g.affected_by("e").is_empty());
        assert!(g.affected_by("unknown").is_empty());
    }

    #[test]
    fn implicit_leaf_nodes_are_part_of_the_order() {
        let g = graph(&[("b", &["a"])]).unwrap();
        assert_eq!(g.topo_order(), ids(&["a", "b"]).as_slice());
        assert_eq!(g.dependents_of("a"), ids(&["b"]));
        assert_eq!(g.dependencies_of("b"), ids(&["a"]));
    }

    #[test]
    fn cycles_report_their_path() {
        let err = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("x", &[])]).unwrap_err();
        assert_eq!(err.path, ids(&["a", "b", "c", "a"]));
        assert_eq!(err.to_string(), "circular dependency: a -> b -> c -> a");
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let err = graph(&[("a", &["a"])]).unwrap_err();
        assert_eq!(err.path, ids(&["a", "a"]));
    }
}
