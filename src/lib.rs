#![warn(missing_docs)]
/*!

`taper` is a small symbolic algebra and automatic-differentiation engine for
scalar expressions over a fixed operator algebra.

Expressions live in a [`TermGraph`], a dense, append-only arena where child
ids always precede parents, so the graph is topologically sorted by
construction and every pass over it is a linear sweep. On top of the graph
sit four pieces:

- [`normalize`]: a canonicalization pass that flattens and constant-folds
  the AC operators (`Add`, `Mul`), erases `Sub` into addition of a negation,
  and sorts children into a deterministic order, so structurally equal means
  semantically interchangeable.
- a pattern language ([`Pattern`]) and matcher ([`match_node`]) with
  placeholder and spread captures, including multiset matching with
  backtracking for the AC operators.
- a rewrite engine ([`Rule`], [`rewrite_fixed_point`], [`optimize`]) that
  applies priority-ordered, guarded rules post-order to a fixed point,
  interleaved with normalization.
- a reverse-mode [`Tape`]: a linear program emitted from a graph whose
  forward sweep evaluates and whose reverse sweep ([`Tape::vjp`]) computes
  the gradient.

Graphs can also be streamed into any foreign backend through the
[`Emitter`] protocol; the CSE drivers ([`emit_cse`], [`emit_hash_cse`])
guarantee each structurally distinct subtree is emitted exactly once.

## Example

```
use taper::{eval, Tape, TermGraph};

// f(x0, x1) = sin(x0) * x1 + x1 * x1
let mut g = TermGraph::default();
let x0 = g.var(0);
let x1 = g.var(1);
let s = g.sin(x0);
let lhs = g.product([s, x1]);
let rhs = g.product([x1, x1]);
g.sum([lhs, rhs]);

let at = [1.2, 2.0];
let v = eval(&g, &at);
assert!((v - (1.2f64.sin() * 2.0 + 4.0)).abs() < 1e-12);

// Reverse-mode gradient from the same expression.
let tape = Tape::from_graph(&g);
assert!((tape.forward(&at) - v).abs() < 1e-12);
let grad = tape.vjp(&at);
assert!((grad[0] - 2.0 * 1.2f64.cos()).abs() < 1e-12);
assert!((grad[1] - (1.2f64.sin() + 4.0)).abs() < 1e-12);
```

Rewriting uses the shipped rule table (see [`default_rules`]):

```
use taper::{optimize, TermGraph};

let mut g = TermGraph::default();
let x = g.var(0);
let e = g.exp(x);
g.log(e);

assert_eq!(optimize(&g).to_string(), "V(0)");
```

## Logging

The matcher and rewriter report progress through the
[`log`](https://docs.rs/log/) crate: per-pass summaries at `debug`,
per-rule firings at `trace`. Use `env_logger` (or any facade consumer) in
your binary or test and set `RUST_LOG=taper=debug` to see them.

*/

mod emit;
mod eval;
pub mod finite_diff;
mod matcher;
mod normalize;
mod pattern;
mod rewrite;
mod rules;
mod tape;
mod term;
mod util;

pub use emit::{emit, emit_cse, emit_hash_cse, Emitter, GraphEmitter};
pub use eval::eval;
pub use matcher::{match_node, match_root, Bindings};
pub use normalize::{denormalize_sub, normalize};
pub use pattern::Pattern;
pub use rewrite::{
    apply_rules_once, optimize, rewrite_fixed_point, Guard, Rule, RuleError, DEFAULT_MAX_PASSES,
};
pub use rules::default_rules;
pub use tape::{Inst, Tape, TapeEmitter};
pub use term::{Id, Node, Op, TermGraph};
pub use util::Symbol;

#[cfg(test)]
fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
