//! Keeps test side effects out of the artifact that continues downstream.
//!
//! Validation states are derived from the artifact but their contents are
//! never passed on. A [`FinalState`] names both the states that must be
//! evaluated and the state whose bytes are handed back, which is always the
//! pristine artifact unless the suite failed.

use crate::graph::{Graph, Node, NodeId, Op};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalState {
    /// Evaluated for their side effects only.
    pub forced: Vec<NodeId>,
    /// The contents handed back.
    pub passthrough: NodeId,
}

impl FinalState {
    /// The artifact, with nothing attached.
    pub fn untouched(artifact: NodeId) -> Self {
        Self {
            forced: Vec::new(),
            passthrough: artifact,
        }
    }

    /// The artifact's contents, evaluable only after every validation.
    pub fn guard(artifact: NodeId, validations: Vec<NodeId>) -> Self {
        Self {
            forced: validations,
            passthrough: artifact,
        }
    }

    pub fn is_untouched(&self) -> bool {
        self.forced.is_empty()
    }

    /// A single node that stands for this state.
    ///
    /// Without forced dependencies the passthrough itself is returned, so an
    /// untouched artifact keeps its identity.
    pub fn into_node(&self, graph: &mut Graph) -> NodeId {
        if self.forced.is_empty() {
            return self.passthrough;
        }
        graph.add(Node::new(Op::Passthrough {
            output: self.passthrough,
            forced: self.forced.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ExecOp;

    #[test]
    fn untouched_keeps_identity() {
        let mut graph = Graph::new();
        let artifact = graph.source("artifact");
        let state = FinalState::untouched(artifact);
        assert!(state.is_untouched());
        assert_eq!(state.into_node(&mut graph), artifact);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn guard_forces_validations_and_passes_artifact_through() {
        let mut graph = Graph::new();
        let artifact = graph.source("artifact");
        let check = graph.add(Node::new(Op::Exec(ExecOp::new(
            artifact,
            vec!["touch".to_string(), "/leak".to_string()],
        ))));
        let node = FinalState::guard(artifact, vec![check]).into_node(&mut graph);

        match &graph.node(node).op {
            Op::Passthrough { output, forced } => {
                assert_eq!(*output, artifact);
                assert_eq!(forced, &vec![check]);
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert!(graph.reachable(node).contains(&check));
    }
}
