use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::node::FieldNode;
use crate::error::ValidationError;
use crate::field::{FieldSpec, Note, NoteId, field_key};
use crate::prompt::PromptAnalyzer;

/// The smart fields of one note and the order they can run in.
///
/// Construction validates the whole graph: a self-reference, unknown field or
/// cycle rejects it before any node runs.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    note_id: NoteId,
    nodes: BTreeMap<String, FieldNode>,
    layers: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph for `note` from its note type's field specs.
    pub fn build(note: &Note, specs: &[FieldSpec]) -> Result<Self, ValidationError> {
        let analyzer = PromptAnalyzer::for_note(note, specs);
        let mut nodes = Vec::with_capacity(specs.len());

        for spec in specs {
            let name = note
                .canonical_name(&spec.name)
                .ok_or_else(|| ValidationError::MissingField(spec.name.clone()))?;
            let mut node = FieldNode::new(note.id, name, spec);
            // Plain note fields are inputs, not edges.
            node.dependencies = analyzer
                .dependencies(&spec.name, &spec.prompt)?
                .into_iter()
                .filter(|dep| analyzer.is_smart(dep))
                .collect();
            nodes.push(node);
        }

        Self::from_nodes(note.id, nodes)
    }

    /// Validate that `candidate` could be saved alongside `specs` for this
    /// note, replacing any spec for the same field.
    pub fn check_candidate(
        note: &Note,
        specs: &[FieldSpec],
        candidate: &FieldSpec,
    ) -> Result<(), ValidationError> {
        let mut merged: Vec<FieldSpec> = specs
            .iter()
            .filter(|s| s.key() != candidate.key())
            .cloned()
            .collect();
        merged.push(candidate.clone());
        Self::build(note, &merged).map(|_| ())
    }

    /// Assemble a graph from nodes whose `dependencies` are already set.
    /// Reverse edges are derived here.
    pub fn from_nodes(note_id: NoteId, nodes: Vec<FieldNode>) -> Result<Self, ValidationError> {
        let mut nodes_by_key = BTreeMap::new();
        for node in nodes {
            let key = node.key().to_string();
            if nodes_by_key.contains_key(&key) {
                return Err(ValidationError::DuplicateField(node.name));
            }
            nodes_by_key.insert(key, node);
        }
        let mut nodes: BTreeMap<String, FieldNode> = nodes_by_key;

        let mut edges = Vec::new();
        for (key, node) in &nodes {
            for dep in &node.dependencies {
                if dep == key {
                    return Err(ValidationError::SelfReference { field: key.clone() });
                }
                if !nodes.contains_key(dep) {
                    return Err(ValidationError::UnknownField {
                        field: key.clone(),
                        reference: dep.clone(),
                    });
                }
                edges.push((dep.clone(), key.clone()));
            }
        }
        for node in nodes.values_mut() {
            node.dependents.clear();
        }
        for (dep, dependent) in edges {
            if let Some(node) = nodes.get_mut(&dep) {
                node.dependents.insert(dependent);
            }
        }

        let layers = compute_layers(&nodes)?;
        debug!(note_id, nodes = nodes.len(), layers = layers.len(), "built dependency graph");
        Ok(Self {
            note_id,
            nodes,
            layers,
        })
    }

    /// Keep only `target` and everything it transitively depends on.
    pub fn trim_to_target(self, target: &str) -> Result<Self, ValidationError> {
        let target = field_key(target);
        if !self.nodes.contains_key(&target) {
            return Err(ValidationError::UnknownTarget(target));
        }

        let mut keep = BTreeSet::from([target.clone()]);
        let mut explore: Vec<String> = self.nodes[&target].dependencies.iter().cloned().collect();
        while let Some(key) = explore.pop() {
            if keep.insert(key.clone()) {
                explore.extend(self.nodes[&key].dependencies.iter().cloned());
            }
        }

        let nodes = self
            .nodes
            .into_values()
            .filter(|n| keep.contains(n.key()))
            .map(|mut n| {
                if n.key() == target {
                    n.is_target = true;
                } else {
                    n.generate_despite_manual = true;
                }
                n
            })
            .collect();
        Self::from_nodes(self.note_id, nodes)
    }

    pub fn note_id(&self) -> NoteId {
        self.note_id
    }

    /// Execution order: every node appears in exactly one layer, after all of
    /// its dependencies.
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    pub fn layer_of(&self, key: &str) -> Option<usize> {
        self.layers
            .iter()
            .position(|layer| layer.iter().any(|k| k == key))
    }

    pub fn node(&self, key: &str) -> Option<&FieldNode> {
        self.nodes.get(key)
    }

    pub fn node_mut(&mut self, key: &str) -> Option<&mut FieldNode> {
        self.nodes.get_mut(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FieldNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Kahn's algorithm, extracting every zero in-degree node per round.
fn compute_layers(nodes: &BTreeMap<String, FieldNode>) -> Result<Vec<Vec<String>>, ValidationError> {
    let mut remaining: BTreeMap<&str, usize> = nodes
        .iter()
        .map(|(k, n)| (k.as_str(), n.dependencies.len()))
        .collect();
    let mut layers = Vec::new();

    loop {
        let layer: Vec<String> = remaining
            .iter()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(k, _)| k.to_string())
            .collect();
        if layer.is_empty() {
            break;
        }
        for key in &layer {
            remaining.remove(key.as_str());
            for dependent in &nodes[key].dependents {
                if let Some(deg) = remaining.get_mut(dependent.as_str()) {
                    *deg -= 1;
                }
            }
        }
        layers.push(layer);
    }

    if remaining.is_empty() {
        Ok(layers)
    } else {
        let unresolved: BTreeSet<&str> = remaining.into_keys().collect();
        Err(ValidationError::Cycle {
            cycle: find_cycle(nodes, &unresolved),
        })
    }
}

/// Every unresolved node still has an unresolved dependency, so following
/// them from any start must revisit a node.
fn find_cycle(nodes: &BTreeMap<String, FieldNode>, unresolved: &BTreeSet<&str>) -> Vec<String> {
    let Some(&start) = unresolved.iter().next() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = Vec::new();
    let mut current = start;

    loop {
        if let Some(pos) = path.iter().position(|&k| k == current) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|k| nodes[*k].name.clone()).collect();
            cycle.push(nodes[current].name.clone());
            return cycle;
        }
        path.push(current);
        match nodes[current]
            .dependencies
            .iter()
            .find(|d| unresolved.contains(d.as_str()))
        {
            Some(next) => current = next.as_str(),
            None => return path.iter().map(|k| nodes[*k].name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldKind;
    use crate::graph::node::NodeState;

    fn vocab_note() -> Note {
        Note::new(1, "Vocab")
            .with_field("Vocab", "perro")
            .with_field("Sentence", "")
            .with_field("Mnemonic", "")
    }

    fn layer_sets(graph: &DependencyGraph) -> Vec<BTreeSet<String>> {
        graph
            .layers()
            .iter()
            .map(|l| l.iter().cloned().collect())
            .collect()
    }

    #[test]
    fn chained_fields_layer_in_order() {
        let specs = vec![
            FieldSpec::text("Vocab", "Pick a word").manual(),
            FieldSpec::text("Sentence", "Use {{vocab}}"),
            FieldSpec::text("Mnemonic", "Remember {{sentence}}"),
        ];
        let graph = DependencyGraph::build(&vocab_note(), &specs).unwrap();
        assert_eq!(
            layer_sets(&graph),
            vec![
                BTreeSet::from(["vocab".to_string()]),
                BTreeSet::from(["sentence".to_string()]),
                BTreeSet::from(["mnemonic".to_string()]),
            ]
        );
        let vocab = graph.node("vocab").unwrap();
        assert_eq!(vocab.dependents, BTreeSet::from(["sentence".to_string()]));
        assert_eq!(graph.layer_of("mnemonic"), Some(2));
    }

    #[test]
    fn two_prompts_for_one_field_are_rejected() {
        let specs = vec![
            FieldSpec::text("Sentence", "Use {{vocab}}"),
            FieldSpec::text("sentence", "Say {{vocab}}"),
        ];
        assert_eq!(
            DependencyGraph::build(&vocab_note(), &specs).unwrap_err(),
            ValidationError::DuplicateField("Sentence".into())
        );
    }

    #[test]
    fn plain_fields_are_not_edges() {
        let specs = vec![
            FieldSpec::text("Sentence", "Use {{vocab}}"),
            FieldSpec::text("Mnemonic", "Remember {{vocab}}"),
        ];
        let graph = DependencyGraph::build(&vocab_note(), &specs).unwrap();
        assert_eq!(graph.layers().len(), 1);
        assert!(graph.node("sentence").unwrap().dependencies.is_empty());
    }

    #[test]
    fn layers_partition_all_nodes() {
        let note = Note::new(1, "T")
            .with_field("a", "")
            .with_field("b", "")
            .with_field("c", "")
            .with_field("d", "")
            .with_field("e", "x");
        let specs = vec![
            FieldSpec::text("a", "{{e}}"),
            FieldSpec::text("b", "{{a}}"),
            FieldSpec::text("c", "{{a}} {{e}}"),
            FieldSpec::text("d", "{{b}} {{c}}"),
        ];
        let graph = DependencyGraph::build(&note, &specs).unwrap();

        let mut seen = BTreeSet::new();
        for layer in graph.layers() {
            for key in layer {
                assert!(seen.insert(key.clone()), "{key} appears twice");
            }
        }
        assert_eq!(seen.len(), graph.len());

        for node in graph.nodes() {
            let own = graph.layer_of(node.key()).unwrap();
            for dep in &node.dependencies {
                assert!(graph.layer_of(dep).unwrap() < own);
            }
            if node.dependencies.is_empty() {
                assert_eq!(own, 0);
            }
        }
    }

    #[test]
    fn two_field_cycle_is_rejected() {
        let note = Note::new(1, "T").with_field("A", "").with_field("B", "");
        let specs = vec![FieldSpec::text("A", "{{b}}"), FieldSpec::text("B", "{{a}}")];
        let err = DependencyGraph::build(&note, &specs).unwrap_err();
        assert_eq!(
            err,
            ValidationError::Cycle {
                cycle: vec!["A".into(), "B".into(), "A".into()]
            }
        );
    }

    #[test]
    fn cycle_behind_a_valid_prefix_is_named() {
        let note = Note::new(1, "T")
            .with_field("a", "")
            .with_field("b", "")
            .with_field("c", "")
            .with_field("d", "");
        let specs = vec![
            FieldSpec::text("a", "root"),
            FieldSpec::text("b", "{{a}} {{d}}"),
            FieldSpec::text("c", "{{b}}"),
            FieldSpec::text("d", "{{c}}"),
        ];
        let Err(ValidationError::Cycle { cycle }) = DependencyGraph::build(&note, &specs) else {
            panic!("expected a cycle");
        };
        assert_eq!(cycle.first(), cycle.last());
        assert!(!cycle.contains(&"a".to_string()));
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn self_reference_rejected_before_graph() {
        let note = Note::new(1, "T").with_field("A", "");
        let err = DependencyGraph::build(&note, &[FieldSpec::text("A", "{{A}}")]).unwrap_err();
        assert_eq!(err, ValidationError::SelfReference { field: "a".into() });
    }

    #[test]
    fn from_nodes_rejects_self_loop() {
        let mut node = FieldNode::new(1, "a", &FieldSpec::text("a", ""));
        node.dependencies.insert("a".into());
        assert!(matches!(
            DependencyGraph::from_nodes(1, vec![node]),
            Err(ValidationError::SelfReference { .. })
        ));
    }

    #[test]
    fn spec_for_missing_field_is_rejected() {
        let note = Note::new(1, "T").with_field("A", "");
        let err = DependencyGraph::build(&note, &[FieldSpec::text("Z", "x")]).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("Z".into()));
    }

    #[test]
    fn trim_keeps_target_and_ancestors() {
        let note = Note::new(1, "T")
            .with_field("a", "")
            .with_field("b", "")
            .with_field("c", "")
            .with_field("side", "");
        let specs = vec![
            FieldSpec::text("a", "root").manual(),
            FieldSpec::text("b", "{{a}}"),
            FieldSpec::text("c", "{{b}}"),
            FieldSpec::text("side", "{{a}}"),
        ];
        let graph = DependencyGraph::build(&note, &specs)
            .unwrap()
            .trim_to_target("B")
            .unwrap();

        assert_eq!(graph.len(), 2);
        assert!(graph.node("b").unwrap().is_target);
        let a = graph.node("a").unwrap();
        assert!(a.generate_despite_manual);
        assert_eq!(a.dependents, BTreeSet::from(["b".to_string()]));
        assert!(graph.node("side").is_none());
        assert!(graph.nodes().all(|n| n.state() == &NodeState::Pending));
    }

    #[test]
    fn trim_rejects_unknown_target() {
        let note = Note::new(1, "T").with_field("a", "");
        let graph = DependencyGraph::build(&note, &[FieldSpec::text("a", "x")]).unwrap();
        assert_eq!(
            graph.trim_to_target("zzz").unwrap_err(),
            ValidationError::UnknownTarget("zzz".into())
        );
    }

    #[test]
    fn candidate_that_closes_a_cycle_is_rejected() {
        let note = Note::new(1, "T").with_field("a", "").with_field("b", "");
        let specs = vec![FieldSpec::text("b", "{{a}}")];
        assert!(DependencyGraph::check_candidate(&note, &specs, &FieldSpec::text("a", "x")).is_ok());
        assert!(matches!(
            DependencyGraph::check_candidate(&note, &specs, &FieldSpec::text("a", "{{b}}")),
            Err(ValidationError::Cycle { .. })
        ));
    }

    #[test]
    fn speech_field_can_read_text_fields() {
        let note = Note::new(1, "T")
            .with_field("word", "gato")
            .with_field("sentence", "")
            .with_field("audio", "");
        let specs = vec![
            FieldSpec::text("sentence", "{{word}}"),
            FieldSpec::new("audio", FieldKind::Speech, "{{sentence}}"),
        ];
        let graph = DependencyGraph::build(&note, &specs).unwrap();
        assert_eq!(graph.layer_of("audio"), Some(1));
    }
}
