//! Recording of kernel invocations for reverse-mode differentiation.
//!
//! While a tape is recording, every differentiable op run through
//! [`Math`] appends a [`KernelNode`]. Closing the tape makes the nodes
//! playable; backward replay must then visit them in strictly reverse
//! creation order, and each node yields its gradient exactly once.
//!
//! ```rust
//! use ndtape::{array, Math};
//!
//! let math = Math::cpu();
//! let x = array!([1.0, 2.0, 3.0]);
//! let grads = math
//!     .gradients(|m| {
//!         let y = m.square(&x)?;
//!         m.sum(&y, None)
//!     }, &[&x])
//!     .unwrap();
//! assert_eq!(grads[0].data_sync().unwrap(), vec![2.0, 4.0, 6.0]);
//! ```

mod node;

pub use node::{GradientFn, GradientThunk, InputGradients, KernelArgs, KernelNode, NodeId};

use crate::error::{Error, Result};
use crate::math::Math;
use crate::ndarray::NDArray;
use std::collections::{HashMap, HashSet};

/// Lifecycle of a recorded node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The tape is still open.
    Recording,
    /// Closed and waiting for its gradient request.
    Playable,
    /// Its gradient was requested or it was skipped during replay.
    Consumed,
    /// The tape was discarded.
    Discarded,
}

struct TapeEntry {
    node: KernelNode,
    state: NodeState,
}

/// An ordered log of kernel invocations.
#[derive(Default)]
pub struct Tape {
    entries: Vec<TapeEntry>,
    closed: bool,
}

impl Tape {
    /// An empty, open tape.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether recording has finished.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Recorded nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &KernelNode)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (NodeId(i), &e.node))
    }

    /// State of node `id`.
    #[must_use]
    pub fn state(&self, id: NodeId) -> Option<NodeState> {
        self.entries.get(id.0).map(|e| e.state)
    }

    /// Appends a node.
    ///
    /// # Errors
    ///
    /// [`Error::TapeState`] once the tape is closed.
    pub fn record(&mut self, node: KernelNode) -> Result<NodeId> {
        if self.closed {
            return Err(Error::TapeState("cannot record on a closed tape"));
        }
        log::trace!("tape: recorded `{}` as node {}", node.name, self.entries.len());
        self.entries.push(TapeEntry {
            node,
            state: NodeState::Recording,
        });
        Ok(NodeId(self.entries.len() - 1))
    }

    /// Finishes recording; every node becomes playable.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for entry in &mut self.entries {
            if entry.state == NodeState::Recording {
                entry.state = NodeState::Playable;
            }
        }
    }

    /// Drops the gradients of every node without replaying them.
    pub fn discard(&mut self) {
        self.closed = true;
        for entry in &mut self.entries {
            entry.state = NodeState::Discarded;
            entry.node.gradient = Box::new(|_, _| InputGradients::new());
        }
    }

    /// The node replay must visit next: the newest playable one.
    #[must_use]
    pub fn next_expected(&self) -> Option<NodeId> {
        self.entries
            .iter()
            .rposition(|e| e.state == NodeState::Playable)
            .map(NodeId)
    }

    fn consume(&mut self, id: NodeId) -> Result<&mut TapeEntry> {
        if !self.closed {
            return Err(Error::TapeState("gradients require a closed tape"));
        }
        let expected = self.next_expected();
        if expected != Some(id) {
            return Err(Error::TapeOrderViolation {
                expected: expected.map(|n| n.0),
                got: id.0,
            });
        }
        let entry = &mut self.entries[id.0];
        entry.state = NodeState::Consumed;
        Ok(entry)
    }

    /// Produces the input gradients of node `id` for output gradient `dy`.
    ///
    /// Only the newest playable node may be asked; each node answers once.
    ///
    /// # Errors
    ///
    /// [`Error::TapeOrderViolation`] out of order or on a second request,
    /// [`Error::TapeState`] while the tape is still open.
    pub fn take_gradient(&mut self, id: NodeId, dy: &NDArray) -> Result<InputGradients> {
        let entry = self.consume(id)?;
        Ok((entry.node.gradient)(dy, &entry.node.output))
    }

    /// Consumes node `id` without computing anything.
    ///
    /// # Errors
    ///
    /// Same as [`take_gradient`](Self::take_gradient).
    pub fn skip(&mut self, id: NodeId) -> Result<()> {
        self.consume(id).map(|_| ())
    }

    /// Reverse-mode gradients of scalar `y` with respect to each of `xs`.
    ///
    /// Closes the tape if needed, then replays it newest-first. Only the
    /// thunks of inputs that depend on some `x` are evaluated; gradients of
    /// an array used several times are summed. An `x` that `y` does not
    /// depend on receives zeros.
    ///
    /// Views made with [`NDArray::reshape`] and friends are not recorded.
    /// An input that no node produced is resolved to the earlier array
    /// sharing its data, and its gradient is reshaped to that array.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if `y` is not a single element, tape order
    /// errors if the tape was already partly replayed, or any kernel error.
    pub fn backward(&mut self, math: &Math, y: &NDArray, xs: &[&NDArray]) -> Result<Vec<NDArray>> {
        if y.size() != 1 {
            return Err(Error::shape("gradients", y.shape(), &[]));
        }
        self.close();

        let mut aliases = Aliases::default();
        for x in xs {
            aliases.register(x);
        }
        let mut depends: HashSet<usize> = xs.iter().map(|x| x.id()).collect();
        let mut input_keys: Vec<Vec<Key>> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let keys: Vec<Key> = entry.node.inputs.iter().map(|(_, a)| aliases.resolve(a)).collect();
            if keys.iter().any(|k| depends.contains(&k.id)) {
                depends.insert(entry.node.output.id());
            }
            aliases.register(&entry.node.output);
            input_keys.push(keys);
        }

        let mut grads: HashMap<usize, NDArray> = HashMap::new();
        let root = aliases.resolve(y);
        if depends.contains(&root.id) {
            grads.insert(root.id, math.fill(root.shape, 1.0));
        }

        for index in (0..self.entries.len()).rev() {
            if self.entries[index].state != NodeState::Playable {
                continue;
            }
            let id = NodeId(index);
            let out_id = self.entries[index].node.output.id();
            let Some(dy) = grads.get(&out_id).cloned() else {
                self.skip(id)?;
                continue;
            };
            let names: Vec<&'static str> = self.entries[index].node.inputs.iter().map(|(n, _)| *n).collect();
            let mut thunks = self.take_gradient(id, &dy)?;
            for (name, key) in names.into_iter().zip(&input_keys[index]) {
                if !depends.contains(&key.id) {
                    continue;
                }
                let Some(thunk) = thunks.take(name) else {
                    continue;
                };
                let mut g = thunk.compute(math)?;
                if g.shape() != key.shape.as_slice() {
                    g = g.reshape(key.shape.clone())?;
                }
                let total = match grads.remove(&key.id) {
                    Some(prev) => math.add(&prev, &g)?,
                    None => g,
                };
                grads.insert(key.id, total);
            }
        }

        xs.iter()
            .map(|x| match grads.get(&x.id()) {
                Some(g) => Ok(g.clone()),
                None => Ok(math.fill(x.shape().to_vec(), 0.0)),
            })
            .collect()
    }
}

/// Gradient slot an input accumulates into.
struct Key {
    id: usize,
    shape: Vec<usize>,
}

/// Arrays known to the replay, by data id: the targets first, then node
/// outputs in creation order.
#[derive(Default)]
struct Aliases {
    known: HashSet<usize>,
    owners: HashMap<usize, Key>,
}

impl Aliases {
    fn register(&mut self, a: &NDArray) {
        self.known.insert(a.id());
        self.owners.entry(a.data_id()).or_insert_with(|| Key {
            id: a.id(),
            shape: a.shape().to_vec(),
        });
    }

    fn resolve(&self, a: &NDArray) -> Key {
        if !self.known.contains(&a.id()) {
            if let Some(owner) = self.owners.get(&a.data_id()) {
                return Key {
                    id: owner.id,
                    shape: owner.shape.clone(),
                };
            }
        }
        Key {
            id: a.id(),
            shape: a.shape().to_vec(),
        }
    }
}

impl core::fmt::Debug for Tape {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tape")
            .field("nodes", &self.entries.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array;

    #[test]
    fn replay_must_run_newest_first() {
        let math = Math::cpu();
        math.start_tape().unwrap();
        let a = array!([1.0, 2.0]);
        let b = math.exp(&a).unwrap();
        let _c = math.neg(&b).unwrap();
        let mut tape = math.finish_tape().unwrap();
        assert_eq!(tape.len(), 2);
        assert_eq!(tape.state(NodeId(0)), Some(NodeState::Playable));

        let dy = array!([1.0, 1.0]);
        assert!(matches!(
            tape.take_gradient(NodeId(0), &dy),
            Err(Error::TapeOrderViolation { expected: Some(1), got: 0 })
        ));
        assert!(tape.take_gradient(NodeId(1), &dy).is_ok());
        assert!(matches!(
            tape.take_gradient(NodeId(1), &dy),
            Err(Error::TapeOrderViolation { expected: Some(0), got: 1 })
        ));
        assert!(tape.take_gradient(NodeId(0), &dy).is_ok());
        assert_eq!(tape.next_expected(), None);
    }

    #[test]
    fn open_tape_refuses_gradients() {
        let mut tape = Tape::new();
        let x = array!([1.0]);
        tape.record(KernelNode::new("identity", vec![("x", x.clone())], KernelArgs::None, x.clone(), |_, _| {
            InputGradients::new()
        }))
        .unwrap();
        assert!(matches!(tape.take_gradient(NodeId(0), &x), Err(Error::TapeState(_))));
        tape.discard();
        assert_eq!(tape.state(NodeId(0)), Some(NodeState::Discarded));
        assert!(tape.record(KernelNode::new("late", Vec::new(), KernelArgs::None, x.clone(), |_, _| {
            InputGradients::new()
        }))
        .is_err());
    }

    #[test]
    fn nodes_expose_their_inputs() {
        let math = Math::cpu();
        let a = array!([1.0, 2.0]);
        let b = array!([3.0, 4.0]);
        math.start_tape().unwrap();
        let c = math.multiply(&a, &b).unwrap();
        let _d = math.exp(&c).unwrap();
        let mut tape = math.finish_tape().unwrap();

        let names: Vec<&str> = tape.nodes().map(|(_, n)| n.name).collect();
        assert_eq!(names, vec!["mul", "exp"]);
        let (first, node) = tape.nodes().next().unwrap();
        assert_eq!(first, NodeId(0));
        assert_eq!(node.input("b").map(NDArray::id), Some(b.id()));
        assert!(node.input("x").is_none());

        tape.skip(NodeId(1)).unwrap();
        let grads = tape.take_gradient(NodeId(0), &array!([1.0, 1.0])).unwrap();
        assert_eq!(grads.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
