use crate::term::{Id, Node, Op, TermGraph};
use crate::util::HashMap;

/// A consumer of expression structure.
///
/// A backend receives one callback per emitted node (`emit_const` and
/// `emit_var` for leaves, `emit_apply` for interior operators with the
/// already-emitted child handles) and returns an opaque handle of its own
/// choosing. The drivers below walk a [`TermGraph`] in post-order and hand
/// back the root's handle.
///
/// Backends are assumed total: there is no error channel here. A fallible
/// backend reports failures through its handle type or its own state.
pub trait Emitter {
    /// Opaque per-node handle.
    type Handle: Clone;

    /// Emit a literal.
    fn emit_const(&mut self, value: f64) -> Self::Handle;

    /// Emit an input slot.
    fn emit_var(&mut self, index: usize) -> Self::Handle;

    /// Emit an interior operator over previously emitted children.
    /// `op` is never `Const` or `Var`; those go through the leaf methods.
    fn emit_apply(&mut self, op: Op, args: &[Self::Handle]) -> Self::Handle;
}

enum Frame {
    Enter(Id),
    Apply(Id),
}

/// Plain driver: post-order walk that re-emits every node occurrence,
/// making no attempt to share repeated or even id-shared subtrees. Uses an
/// explicit stack, so arbitrarily deep expressions are fine.
pub fn emit<B: Emitter>(g: &TermGraph, backend: &mut B) -> B::Handle {
    let mut stack = vec![Frame::Enter(g.root())];
    let mut out: Vec<B::Handle> = Vec::new();
    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(id) => match g[id].op() {
                Op::Const(v) => out.push(backend.emit_const(v)),
                Op::Var(ix) => out.push(backend.emit_var(ix)),
                _ => {
                    stack.push(Frame::Apply(id));
                    for &c in g[id].children().iter().rev() {
                        stack.push(Frame::Enter(c));
                    }
                }
            },
            Frame::Apply(id) => {
                let node = &g[id];
                let split = out.len() - node.children().len();
                let args = out.split_off(split);
                out.push(backend.emit_apply(node.op(), &args));
            }
        }
    }
    debug_assert_eq!(out.len(), 1);
    out.pop().unwrap()
}

enum CseFrame {
    Enter(Id),
    Apply(Id, String),
}

/// CSE driver keyed on the canonical structural string: every structurally
/// equal subtree is emitted exactly once and its handle reused. On an
/// expression with no repeated subtrees this emits exactly what the plain
/// driver does.
pub fn emit_cse<B: Emitter>(g: &TermGraph, backend: &mut B) -> B::Handle {
    let mut memo: HashMap<String, B::Handle> = HashMap::default();
    let mut stack = vec![CseFrame::Enter(g.root())];
    let mut out: Vec<B::Handle> = Vec::new();
    while let Some(frame) = stack.pop() {
        match frame {
            CseFrame::Enter(id) => {
                let key = g.canonical(id);
                if let Some(h) = memo.get(&key) {
                    out.push(h.clone());
                    continue;
                }
                match g[id].op() {
                    Op::Const(v) => {
                        let h = backend.emit_const(v);
                        memo.insert(key, h.clone());
                        out.push(h);
                    }
                    Op::Var(ix) => {
                        let h = backend.emit_var(ix);
                        memo.insert(key, h.clone());
                        out.push(h);
                    }
                    _ => {
                        stack.push(CseFrame::Apply(id, key));
                        for &c in g[id].children().iter().rev() {
                            stack.push(CseFrame::Enter(c));
                        }
                    }
                }
            }
            CseFrame::Apply(id, key) => {
                let node = &g[id];
                let split = out.len() - node.children().len();
                let args = out.split_off(split);
                let h = backend.emit_apply(node.op(), &args);
                memo.insert(key, h.clone());
                out.push(h);
            }
        }
    }
    out.pop().unwrap()
}

/// CSE driver keyed on the 64-bit structural hash, falling back to the
/// canonical string within a bucket on collision. Interchangeable with
/// [`emit_cse`]: both emit each structurally distinct subtree exactly once.
pub fn emit_hash_cse<B: Emitter>(g: &TermGraph, backend: &mut B) -> B::Handle {
    fn lookup<H: Clone>(memo: &HashMap<u64, Vec<(Id, H)>>, g: &TermGraph, id: Id) -> Option<H> {
        let bucket = memo.get(&g.structural_hash(id))?;
        let key = g.canonical(id);
        bucket
            .iter()
            .find(|(rep, _)| g.canonical(*rep) == key)
            .map(|(_, h)| h.clone())
    }

    // bucket entries remember a representative id so the string check can
    // be reproduced lazily
    let mut memo: HashMap<u64, Vec<(Id, B::Handle)>> = HashMap::default();
    let mut stack = vec![Frame::Enter(g.root())];
    let mut out: Vec<B::Handle> = Vec::new();
    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(id) => {
                if let Some(h) = lookup(&memo, g, id) {
                    out.push(h);
                    continue;
                }
                match g[id].op() {
                    Op::Const(v) => {
                        let h = backend.emit_const(v);
                        memo.entry(g.structural_hash(id)).or_default().push((id, h.clone()));
                        out.push(h);
                    }
                    Op::Var(ix) => {
                        let h = backend.emit_var(ix);
                        memo.entry(g.structural_hash(id)).or_default().push((id, h.clone()));
                        out.push(h);
                    }
                    _ => {
                        stack.push(Frame::Apply(id));
                        for &c in g[id].children().iter().rev() {
                            stack.push(Frame::Enter(c));
                        }
                    }
                }
            }
            Frame::Apply(id) => {
                let node = &g[id];
                let split = out.len() - node.children().len();
                let args = out.split_off(split);
                let h = backend.emit_apply(node.op(), &args);
                memo.entry(g.structural_hash(id)).or_default().push((id, h.clone()));
                out.push(h);
            }
        }
    }
    out.pop().unwrap()
}

/// A backend that replays an emission into a fresh [`TermGraph`]. Useful
/// both as the foreign-graph half of the emitter contract in tests and to
/// rebuild a compacted graph through a CSE driver.
#[derive(Debug, Clone, Default)]
pub struct GraphEmitter {
    /// The graph under construction.
    pub graph: TermGraph,
}

impl Emitter for GraphEmitter {
    type Handle = Id;

    fn emit_const(&mut self, value: f64) -> Id {
        self.graph.lit(value)
    }

    fn emit_var(&mut self, index: usize) -> Id {
        self.graph.var(index)
    }

    fn emit_apply(&mut self, op: Op, args: &[Id]) -> Id {
        self.graph.add(Node::new(op, args.iter().copied()))
    }
}
