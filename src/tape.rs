use crate::emit::{emit_hash_cse, Emitter};
use crate::term::{Id, Op, TermGraph};

/// A single tape instruction. Operand [`Id`]s index earlier instructions on
/// the same tape, so a tape is topologically sorted by construction, just
/// like a term graph.
///
/// Unlike the normalized graph form, `Sub` survives on the tape: the
/// reverse sweep handles it directly instead of through `Add`/`Neg`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Inst {
    /// Load input slot `i`.
    Var(usize),
    /// Literal value.
    Const(f64),
    /// `a + b`.
    Add(Id, Id),
    /// `a - b`.
    Sub(Id, Id),
    /// `a * b`.
    Mul(Id, Id),
    /// `a / b`.
    Div(Id, Id),
    /// `a ^ b`.
    Pow(Id, Id),
    /// `-a`.
    Neg(Id),
    /// `sin(a)`.
    Sin(Id),
    /// `cos(a)`.
    Cos(Id),
    /// `e^a`.
    Exp(Id),
    /// Natural logarithm.
    Log(Id),
    /// `√a`.
    Sqrt(Id),
    /// Hyperbolic tangent.
    Tanh(Id),
}

impl Inst {
    fn operands(self) -> (Option<Id>, Option<Id>) {
        match self {
            Inst::Var(_) | Inst::Const(_) => (None, None),
            Inst::Neg(a)
            | Inst::Sin(a)
            | Inst::Cos(a)
            | Inst::Exp(a)
            | Inst::Log(a)
            | Inst::Sqrt(a)
            | Inst::Tanh(a) => (Some(a), None),
            Inst::Add(a, b)
            | Inst::Sub(a, b)
            | Inst::Mul(a, b)
            | Inst::Div(a, b)
            | Inst::Pow(a, b) => (Some(a), Some(b)),
        }
    }
}

/// A linear SSA program: the forward sweep evaluates every instruction once
/// in order, the reverse sweep accumulates adjoints from the output back to
/// the `Var` loads. Both are Θ(n) in instruction count.
///
/// `output` names the instruction whose value the tape returns; set it to
/// the handle an emitter driver hands back (or use
/// [`from_graph`](Tape::from_graph), which does).
#[derive(Debug, Clone, Default)]
pub struct Tape {
    insts: Vec<Inst>,
    /// Index of the output instruction.
    pub output: Id,
}

fn ix(id: Id) -> usize {
    id.into()
}

impl Tape {
    /// Append an instruction, returning its index. Panics if an operand
    /// index is not already on the tape.
    pub fn push(&mut self, inst: Inst) -> Id {
        let next = self.insts.len();
        let (a, b) = inst.operands();
        for op in [a, b].into_iter().flatten() {
            assert!(ix(op) < next, "operand {} out of range", op);
        }
        self.insts.push(inst);
        Id::from(next)
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    /// Whether the tape holds no instructions.
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// The instructions, in order.
    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    /// Number of input slots: one past the largest `Var` index captured,
    /// zero if the tape reads no inputs.
    pub fn arity(&self) -> usize {
        self.insts
            .iter()
            .filter_map(|inst| match inst {
                Inst::Var(i) => Some(i + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn values(&self, inputs: &[f64]) -> Vec<f64> {
        let mut val = vec![0.0; self.insts.len()];
        for (i, inst) in self.insts.iter().enumerate() {
            val[i] = match *inst {
                Inst::Var(slot) => inputs[slot],
                Inst::Const(c) => c,
                Inst::Add(a, b) => val[ix(a)] + val[ix(b)],
                Inst::Sub(a, b) => val[ix(a)] - val[ix(b)],
                Inst::Mul(a, b) => val[ix(a)] * val[ix(b)],
                Inst::Div(a, b) => val[ix(a)] / val[ix(b)],
                Inst::Pow(a, b) => val[ix(a)].powf(val[ix(b)]),
                Inst::Neg(a) => -val[ix(a)],
                Inst::Sin(a) => val[ix(a)].sin(),
                Inst::Cos(a) => val[ix(a)].cos(),
                Inst::Exp(a) => val[ix(a)].exp(),
                Inst::Log(a) => val[ix(a)].ln(),
                Inst::Sqrt(a) => val[ix(a)].sqrt(),
                Inst::Tanh(a) => val[ix(a)].tanh(),
            };
        }
        val
    }

    /// Forward sweep: the value at [`output`](Tape::output).
    pub fn forward(&self, inputs: &[f64]) -> f64 {
        self.values(inputs)[ix(self.output)]
    }

    /// Reverse sweep: the gradient of the output with respect to every
    /// input slot, with length [`arity`](Tape::arity). Slots whose index
    /// never appears stay zero.
    ///
    /// Runs the forward sweep first, seeds the output adjoint with 1, then
    /// walks the tape backwards accumulating each instruction's
    /// contribution into its operands' adjoints.
    pub fn vjp(&self, inputs: &[f64]) -> Vec<f64> {
        let val = self.values(inputs);
        let mut bar = vec![0.0; self.insts.len()];
        if self.insts.is_empty() {
            return vec![];
        }
        bar[ix(self.output)] = 1.0;
        for (i, inst) in self.insts.iter().enumerate().rev() {
            let g = bar[i];
            match *inst {
                Inst::Var(_) | Inst::Const(_) => {}
                Inst::Add(a, b) => {
                    bar[ix(a)] += g;
                    bar[ix(b)] += g;
                }
                Inst::Sub(a, b) => {
                    bar[ix(a)] += g;
                    bar[ix(b)] -= g;
                }
                Inst::Mul(a, b) => {
                    bar[ix(a)] += g * val[ix(b)];
                    bar[ix(b)] += g * val[ix(a)];
                }
                Inst::Div(a, b) => {
                    bar[ix(a)] += g / val[ix(b)];
                    bar[ix(b)] -= g * val[ix(a)] / (val[ix(b)] * val[ix(b)]);
                }
                Inst::Pow(a, b) => {
                    let (x, y) = (val[ix(a)], val[ix(b)]);
                    bar[ix(a)] += g * y * x.powf(y - 1.0);
                    bar[ix(b)] += g * x.powf(y) * x.ln();
                }
                Inst::Neg(a) => bar[ix(a)] -= g,
                Inst::Sin(a) => bar[ix(a)] += g * val[ix(a)].cos(),
                Inst::Cos(a) => bar[ix(a)] -= g * val[ix(a)].sin(),
                Inst::Exp(a) => bar[ix(a)] += g * val[ix(a)].exp(),
                Inst::Log(a) => bar[ix(a)] += g / val[ix(a)],
                Inst::Sqrt(a) => bar[ix(a)] += g * (0.5 / val[ix(a)].sqrt()),
                Inst::Tanh(a) => {
                    let t = val[ix(a)].tanh();
                    bar[ix(a)] += g * (1.0 - t * t);
                }
            }
        }
        let mut grad = vec![0.0; self.arity()];
        for (i, inst) in self.insts.iter().enumerate() {
            if let Inst::Var(slot) = *inst {
                grad[slot] = bar[i];
            }
        }
        grad
    }

    /// Build a tape from a term graph through the hash CSE driver and point
    /// [`output`](Tape::output) at the root's instruction.
    pub fn from_graph(g: &TermGraph) -> Tape {
        let mut backend = TapeEmitter::default();
        let out = emit_hash_cse(g, &mut backend);
        backend.tape.output = out;
        backend.tape
    }
}

/// An [`Emitter`] backend that appends tape instructions. Variadic
/// `Add`/`Mul` emissions fold into left-associated binary chains, since
/// tape instructions carry at most two operands.
#[derive(Debug, Clone, Default)]
pub struct TapeEmitter {
    /// The tape under construction.
    pub tape: Tape,
}

impl Emitter for TapeEmitter {
    type Handle = Id;

    fn emit_const(&mut self, value: f64) -> Id {
        self.tape.push(Inst::Const(value))
    }

    fn emit_var(&mut self, index: usize) -> Id {
        self.tape.push(Inst::Var(index))
    }

    fn emit_apply(&mut self, op: Op, args: &[Id]) -> Id {
        match op {
            Op::Add | Op::Mul => {
                let mut acc = args[0];
                for &rhs in &args[1..] {
                    let inst = match op {
                        Op::Add => Inst::Add(acc, rhs),
                        _ => Inst::Mul(acc, rhs),
                    };
                    acc = self.tape.push(inst);
                }
                acc
            }
            Op::Sub => self.tape.push(Inst::Sub(args[0], args[1])),
            Op::Div => self.tape.push(Inst::Div(args[0], args[1])),
            Op::Pow => self.tape.push(Inst::Pow(args[0], args[1])),
            Op::Neg => self.tape.push(Inst::Neg(args[0])),
            Op::Sin => self.tape.push(Inst::Sin(args[0])),
            Op::Cos => self.tape.push(Inst::Cos(args[0])),
            Op::Exp => self.tape.push(Inst::Exp(args[0])),
            Op::Log => self.tape.push(Inst::Log(args[0])),
            Op::Sqrt => self.tape.push(Inst::Sqrt(args[0])),
            Op::Tanh => self.tape.push(Inst::Tanh(args[0])),
            Op::Const(_) | Op::Var(_) => {
                panic!("leaves are emitted through emit_const / emit_var")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::eval;
    use crate::finite_diff::{central_diff, max_abs_diff};

    fn grad_test_graph() -> TermGraph {
        // sin(x0) * x1 + x2 * x2
        let mut g = TermGraph::default();
        let x0 = g.var(0);
        let x1 = g.var(1);
        let x2 = g.var(2);
        let s = g.sin(x0);
        let a = g.product([s, x1]);
        let b = g.product([x2, x2]);
        g.sum([a, b]);
        g
    }

    #[test]
    fn forward_matches_eval() {
        let g = grad_test_graph();
        let tape = Tape::from_graph(&g);
        for at in [[2.4, 6.0, 1.5], [1.2, 2.0, 0.3], [-0.7, 0.1, 3.0]] {
            assert!((tape.forward(&at) - eval(&g, &at)).abs() < 1e-12);
        }
    }

    #[test]
    fn gradient_literals() {
        let g = grad_test_graph();
        let tape = Tape::from_graph(&g);
        let at = [1.2, 2.0, 0.3];

        let f = tape.forward(&at);
        assert!((f - (1.2f64.sin() * 2.0 + 0.09)).abs() < 1e-12);

        let grad = tape.vjp(&at);
        assert_eq!(grad.len(), 3);
        assert!((grad[0] - 2.0 * 1.2f64.cos()).abs() < 1e-12);
        assert!((grad[1] - 1.2f64.sin()).abs() < 1e-12);
        assert!((grad[2] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn gradient_against_finite_differences() {
        // tanh(x0 * x1) + exp(x0) / sqrt(x1) - log(x1)
        let mut g = TermGraph::default();
        let x0 = g.var(0);
        let x1 = g.var(1);
        let m = g.product([x0, x1]);
        let t = g.tanh(m);
        let e = g.exp(x0);
        let sq = g.sqrt(x1);
        let d = g.div(e, sq);
        let l = g.log(x1);
        let td = g.sum([t, d]);
        g.sub(td, l);

        let tape = Tape::from_graph(&g);
        let at = [0.8, 1.7];
        let grad = tape.vjp(&at);
        let numeric = central_diff(|v| tape.forward(v), &at, 1e-6);
        assert!(max_abs_diff(&grad, &numeric) < 1e-6);
    }

    #[test]
    fn pow_gradients() {
        // x0 ^ x1
        let mut g = TermGraph::default();
        let x0 = g.var(0);
        let x1 = g.var(1);
        g.pow(x0, x1);

        let tape = Tape::from_graph(&g);
        let at = [1.6, 2.5];
        let grad = tape.vjp(&at);
        assert!((grad[0] - 2.5 * 1.6f64.powf(1.5)).abs() < 1e-12);
        assert!((grad[1] - 1.6f64.powf(2.5) * 1.6f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn unused_slot_stays_zero() {
        // only x2 appears; slots 0 and 1 must read zero
        let mut tape = Tape::default();
        let v = tape.push(Inst::Var(2));
        let c = tape.push(Inst::Const(3.0));
        tape.output = tape.push(Inst::Mul(v, c));

        assert_eq!(tape.arity(), 3);
        let grad = tape.vjp(&[0.0, 0.0, 5.0]);
        assert_eq!(grad, vec![0.0, 0.0, 3.0]);
    }

    #[test]
    fn shared_operand_accumulates() {
        // y = x * x, dy/dx = 2x
        let mut tape = Tape::default();
        let v = tape.push(Inst::Var(0));
        tape.output = tape.push(Inst::Mul(v, v));
        let grad = tape.vjp(&[3.0]);
        assert!((grad[0] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn variadic_emission_folds_to_binary() {
        let mut g = TermGraph::default();
        let x = g.var(0);
        let y = g.var(1);
        let z = g.var(2);
        g.sum([x, y, z]);

        let tape = Tape::from_graph(&g);
        // 3 loads + 2 adds
        assert_eq!(tape.len(), 5);
        let loads = tape
            .insts()
            .iter()
            .filter(|i| matches!(i, Inst::Var(_)))
            .count();
        let adds = tape
            .insts()
            .iter()
            .filter(|i| matches!(i, Inst::Add(_, _)))
            .count();
        assert_eq!(loads, 3);
        assert_eq!(adds, 2);
        assert!((tape.forward(&[1.0, 2.0, 4.0]) - 7.0).abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn forward_operand_reference_rejected() {
        let mut tape = Tape::default();
        tape.push(Inst::Neg(Id::from(1usize)));
    }
}
