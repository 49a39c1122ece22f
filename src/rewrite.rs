use std::sync::Arc;

use log::{debug, trace};

use crate::matcher::{match_node, Bindings};
use crate::normalize::normalize;
use crate::pattern::Pattern;
use crate::rules::default_rules;
use crate::term::{Id, Node, TermGraph};
use crate::util::{HashMap, IndexMap, Instant, Symbol};

/// Guard predicate evaluated over the source graph and the match bindings.
/// Guards must be pure; the same rule list may be read from many threads.
pub type Guard = Arc<dyn Fn(&TermGraph, &Bindings) -> bool + Send + Sync>;

/// Errors detectable when a rule is constructed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    /// The right-hand side uses a placeholder the left-hand side never
    /// binds, so instantiation could not proceed.
    #[error("rule {rule}: right-hand side uses placeholder {pid} that the left-hand side never binds")]
    UnboundPlaceholder {
        /// Offending rule.
        rule: Symbol,
        /// Offending placeholder id.
        pid: u32,
    },
    /// A spread appeared somewhere other than directly under an `Add` or
    /// `Mul` pattern.
    #[error("rule {rule}: spread {pid} must be a direct child of an Add or Mul pattern")]
    SpreadOutsideAc {
        /// Offending rule.
        rule: Symbol,
        /// Offending spread id.
        pid: u32,
    },
    /// One AC pattern node carried more than one spread.
    #[error("rule {rule}: an Add or Mul pattern may hold at most one spread")]
    MultipleSpreads {
        /// Offending rule.
        rule: Symbol,
    },
}

/// A rewrite rule: a left-hand pattern to match, a right-hand pattern to
/// instantiate, an optional guard over the bindings, and a priority.
///
/// Construction validates the patterns: spreads must sit directly under AC
/// pattern nodes (on either side; a malformed right-hand spread is rejected
/// here rather than given fallback semantics), at most one spread per AC
/// node, and the right-hand side may only use placeholders the left-hand
/// side binds.
#[derive(Clone)]
pub struct Rule {
    /// Name used in logs and errors.
    pub name: Symbol,
    /// Higher priorities fire first; ties keep list order.
    pub priority: i32,
    lhs: Pattern,
    rhs: Pattern,
    guard: Option<Guard>,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("lhs", &self.lhs)
            .field("rhs", &self.rhs)
            .field("guard", &self.guard.is_some())
            .finish()
    }
}

impl Rule {
    /// Validate and build a rule.
    pub fn new(
        name: impl Into<Symbol>,
        lhs: Pattern,
        rhs: Pattern,
        priority: i32,
    ) -> Result<Self, RuleError> {
        let name = name.into();
        let mut holes = Vec::new();
        let mut spreads = Vec::new();
        collect(&lhs, &mut holes, &mut spreads);
        check_spread_placement(name, &lhs)?;
        check_spread_placement(name, &rhs)?;
        check_rhs_bound(name, &rhs, &holes, &spreads)?;
        Ok(Rule {
            name,
            priority,
            lhs,
            rhs,
            guard: None,
        })
    }

    /// Attach a guard; the rule only fires when it returns true.
    pub fn with_guard(
        mut self,
        guard: impl Fn(&TermGraph, &Bindings) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.guard = Some(Arc::new(guard));
        self
    }

    /// The left-hand pattern.
    pub fn lhs(&self) -> &Pattern {
        &self.lhs
    }

    /// The right-hand pattern.
    pub fn rhs(&self) -> &Pattern {
        &self.rhs
    }
}

fn collect(p: &Pattern, holes: &mut Vec<u32>, spreads: &mut Vec<u32>) {
    match p {
        Pattern::Hole(pid) => holes.push(*pid),
        Pattern::Spread(pid) => spreads.push(*pid),
        Pattern::Node(_, ch) => ch.iter().for_each(|c| collect(c, holes, spreads)),
    }
}

fn check_spread_placement(rule: Symbol, p: &Pattern) -> Result<(), RuleError> {
    match p {
        // a root-level spread has no AC parent
        Pattern::Spread(pid) => Err(RuleError::SpreadOutsideAc { rule, pid: *pid }),
        Pattern::Hole(_) => Ok(()),
        Pattern::Node(op, ch) => {
            let mut seen = 0;
            for c in ch {
                match c {
                    Pattern::Spread(pid) => {
                        if !op.is_ac() {
                            return Err(RuleError::SpreadOutsideAc { rule, pid: *pid });
                        }
                        seen += 1;
                        if seen > 1 {
                            return Err(RuleError::MultipleSpreads { rule });
                        }
                    }
                    _ => check_spread_placement(rule, c)?,
                }
            }
            Ok(())
        }
    }
}

fn check_rhs_bound(
    rule: Symbol,
    rhs: &Pattern,
    holes: &[u32],
    spreads: &[u32],
) -> Result<(), RuleError> {
    match rhs {
        Pattern::Hole(pid) => {
            if holes.contains(pid) {
                Ok(())
            } else {
                Err(RuleError::UnboundPlaceholder { rule, pid: *pid })
            }
        }
        Pattern::Spread(pid) => {
            if spreads.contains(pid) {
                Ok(())
            } else {
                Err(RuleError::UnboundPlaceholder { rule, pid: *pid })
            }
        }
        Pattern::Node(_, ch) => ch
            .iter()
            .try_for_each(|c| check_rhs_bound(rule, c, holes, spreads)),
    }
}

/// Clone the subtree at `id` from `src` into `dst`. `memo` maps source ids
/// to destination ids and is shared across the clones of one instantiation,
/// so sharing inside the bound subtrees is preserved. Implemented as a
/// mark-then-copy sweep over the id range below `id`.
fn clone_subtree(src: &TermGraph, dst: &mut TermGraph, id: Id, memo: &mut HashMap<Id, Id>) -> Id {
    if let Some(&done) = memo.get(&id) {
        return done;
    }
    let top = usize::from(id);
    let mut need = vec![false; top + 1];
    need[top] = true;
    for i in (0..=top).rev() {
        if !need[i] || memo.contains_key(&Id::from(i)) {
            continue;
        }
        for &c in src[Id::from(i)].children() {
            need[usize::from(c)] = true;
        }
    }
    for i in 0..=top {
        let cur = Id::from(i);
        if !need[i] || memo.contains_key(&cur) {
            continue;
        }
        let node = src[cur].clone().map_children(|c| memo[&c]);
        let fresh = dst.add(node);
        memo.insert(cur, fresh);
    }
    memo[&id]
}

/// Instantiate an RHS pattern into `dst`: placeholders clone their bound
/// subtrees (memoized), spreads splice their bound lists into the enclosing
/// AC node, concrete nodes rebuild.
fn instantiate(
    pat: &Pattern,
    src: &TermGraph,
    b: &Bindings,
    dst: &mut TermGraph,
    memo: &mut HashMap<Id, Id>,
) -> Id {
    match pat {
        Pattern::Hole(pid) => clone_subtree(src, dst, b[*pid], memo),
        Pattern::Spread(_) => {
            // Rule::new rejects this shape
            panic!("spread outside an AC pattern survived rule validation")
        }
        Pattern::Node(op, pch) => {
            let mut ch = Vec::with_capacity(pch.len());
            for c in pch {
                if let Pattern::Spread(pid) = c {
                    for &bound in b.list(*pid) {
                        ch.push(clone_subtree(src, dst, bound, memo));
                    }
                } else {
                    ch.push(instantiate(c, src, b, dst, memo));
                }
            }
            dst.add(Node::new(*op, ch))
        }
    }
}

/// One post-order pass of rule application over the root closure of `g`.
///
/// At each node the rules are tried in descending priority (stable for
/// ties) against the node's **pre-rewrite** shape; the first match whose
/// guard passes instantiates its RHS into the result graph and shadows the
/// children's rewrites. Unmatched nodes rebuild over their rewritten
/// children. The source graph is never mutated.
pub fn apply_rules_once(g: &TermGraph, rules: &[Rule]) -> TermGraph {
    let mut order: Vec<&Rule> = rules.iter().collect();
    order.sort_by_key(|r| std::cmp::Reverse(r.priority));

    let mut dst = TermGraph::default();
    if g.is_empty() {
        return dst;
    }
    let live = g.reachable();
    let mut rewritten: Vec<Option<Id>> = vec![None; g.len()];
    let mut applied: IndexMap<Symbol, usize> = IndexMap::default();

    for i in 0..g.len() {
        if !live[i] {
            continue;
        }
        let id = Id::from(i);
        let mut new_id = None;
        for rule in &order {
            let mut b = Bindings::default();
            if !match_node(g, id, &rule.lhs, &mut b) {
                continue;
            }
            if let Some(guard) = &rule.guard {
                if !guard(g, &b) {
                    continue;
                }
            }
            trace!("{} fires at node {}", rule.name, id);
            let mut memo = HashMap::default();
            new_id = Some(instantiate(&rule.rhs, g, &b, &mut dst, &mut memo));
            *applied.entry(rule.name).or_default() += 1;
            break;
        }
        let out = new_id.unwrap_or_else(|| {
            let node = g[id]
                .clone()
                .map_children(|c| rewritten[usize::from(c)].unwrap());
            dst.add(node)
        });
        rewritten[i] = Some(out);
    }

    if !applied.is_empty() {
        debug!("rule applications: {:?}", applied);
    }
    dst.set_root(rewritten[usize::from(g.root())].unwrap());
    dst
}

/// Default pass cap for [`rewrite_fixed_point`].
pub const DEFAULT_MAX_PASSES: usize = 6;

/// Drive rule application to a fixed point.
///
/// The input is normalized first; each pass applies the rules once and
/// normalizes the result. The loop stops when a pass changes neither the
/// node count nor the root structure, or after `max_passes` passes,
/// whichever comes first. The cap is the only runtime bound; whether the
/// result converged or ran out of budget is not reported.
pub fn rewrite_fixed_point(g: &TermGraph, rules: &[Rule], max_passes: usize) -> TermGraph {
    let mut prev = normalize(g);
    for pass in 0..max_passes {
        let start = Instant::now();
        let cur = normalize(&apply_rules_once(&prev, rules));
        let done = cur.len() == prev.len() && cur.subtree_eq(cur.root(), &prev, prev.root());
        debug!(
            "pass {}: {} -> {} nodes in {:.2?}",
            pass,
            prev.len(),
            cur.len(),
            start.elapsed()
        );
        if done {
            return cur;
        }
        prev = cur;
    }
    prev
}

/// Normalize and rewrite with the default rule table and default pass cap.
pub fn optimize(g: &TermGraph) -> TermGraph {
    rewrite_fixed_point(g, &default_rules(), DEFAULT_MAX_PASSES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::eval;
    use crate::term::Op;

    fn p(pid: u32) -> Pattern {
        Pattern::hole(pid)
    }

    #[test]
    fn unbound_rhs_placeholder_rejected() {
        let err = Rule::new("bad", p(1).sin(), p(2), 0).unwrap_err();
        assert_eq!(
            err,
            RuleError::UnboundPlaceholder {
                rule: "bad".into(),
                pid: 2
            }
        );
    }

    #[test]
    fn spread_outside_ac_rejected() {
        // spread under a unary operator
        let err = Rule::new("bad", Pattern::spread(1).sin(), p(1), 0).unwrap_err();
        assert!(matches!(err, RuleError::SpreadOutsideAc { pid: 1, .. }));

        // spread at the RHS root
        let lhs = Pattern::add_n(vec![p(1), Pattern::spread(9)]);
        let err = Rule::new("bad2", lhs, Pattern::spread(9), 0).unwrap_err();
        assert!(matches!(err, RuleError::SpreadOutsideAc { pid: 9, .. }));
    }

    #[test]
    fn two_spreads_rejected() {
        let lhs = Pattern::add_n(vec![Pattern::spread(1), Pattern::spread(2)]);
        let err = Rule::new("bad", lhs, Pattern::lit(0.0), 0).unwrap_err();
        assert!(matches!(err, RuleError::MultipleSpreads { .. }));
    }

    #[test]
    fn instantiation_preserves_sharing() {
        crate::init_logger();
        // LHS sin(?1), RHS ?1 + ?1: the bound subtree is cloned once and
        // referenced twice.
        let rule = Rule::new("dup", p(1).sin(), p(1) + p(1), 0).unwrap();

        let mut g = TermGraph::default();
        let x = g.var(0);
        let c = g.lit(2.0);
        let m = g.product([c, x]);
        g.sin(m);

        let out = apply_rules_once(&g, &[rule]);
        let root = &out[out.root()];
        assert!(matches!(root.op(), Op::Add));
        assert_eq!(root.children()[0], root.children()[1]);
        assert!((eval(&out, &[1.5]) - 6.0).abs() < 1e-12);
    }

    #[test]
    fn priority_order_decides() {
        // Two rules both match sin(x); the higher priority one wins even
        // though it is listed second.
        let low = Rule::new("low", p(1).sin(), Pattern::lit(1.0), 1).unwrap();
        let high = Rule::new("high", p(1).sin(), Pattern::lit(2.0), 9).unwrap();

        let mut g = TermGraph::default();
        let x = g.var(0);
        g.sin(x);

        let out = apply_rules_once(&g, &[low, high]);
        assert!(matches!(out[out.root()].op(), Op::Const(c) if c == 2.0));
    }

    #[test]
    fn guard_vetoes_match() {
        let rule = Rule::new("fold_log", p(1).log(), Pattern::lit(0.0), 0)
            .unwrap()
            .with_guard(|g, b| matches!(g[b[1]].op(), Op::Const(c) if c == 1.0));

        let mut g = TermGraph::default();
        let one = g.lit(1.0);
        g.log(one);
        let out = apply_rules_once(&g, std::slice::from_ref(&rule));
        assert!(matches!(out[out.root()].op(), Op::Const(c) if c == 0.0));

        let mut h = TermGraph::default();
        let two = h.lit(2.0);
        h.log(two);
        let out = apply_rules_once(&h, &[rule]);
        assert!(matches!(out[out.root()].op(), Op::Log));
    }

    #[test]
    fn fixed_point_respects_pass_cap() {
        // ?1 -> sin(?1) at the root grows forever; the cap must stop it.
        let rule = Rule::new("grow", p(1).sin(), p(1).sin().sin(), 0).unwrap();

        let mut g = TermGraph::default();
        let x = g.var(0);
        g.sin(x);

        let out = rewrite_fixed_point(&g, &[rule], 3);
        // each pass wraps every Sin again; just confirm it terminated and
        // still evaluates
        assert!(out.len() > g.len());
        assert!(eval(&out, &[0.5]).is_finite());
    }

    #[test]
    fn converged_rewrite_returns_early() {
        let mut g = TermGraph::default();
        let x = g.var(0);
        let y = g.var(1);
        g.sum([x, y]);
        let out = rewrite_fixed_point(&g, &default_rules(), DEFAULT_MAX_PASSES);
        let n = normalize(&g);
        assert!(out.subtree_eq(out.root(), &n, n.root()));
    }

    #[test]
    fn spread_splices_into_rhs() {
        // Add(tanh(?1), rest...) -> Add(?1, rest...)
        let lhs = Pattern::add_n(vec![p(1).tanh(), Pattern::spread(9)]);
        let rhs = Pattern::add_n(vec![p(1), Pattern::spread(9)]);
        let rule = Rule::new("strip_tanh_term", lhs, rhs, 0).unwrap();

        let mut g = TermGraph::default();
        let x = g.var(0);
        let y = g.var(1);
        let z = g.var(2);
        let t = g.tanh(x);
        g.sum([t, y, z]);

        let out = apply_rules_once(&g, &[rule]);
        let root = &out[out.root()];
        assert!(matches!(root.op(), Op::Add));
        assert_eq!(root.children().len(), 3);
        for &c in root.children() {
            assert!(matches!(out[c].op(), Op::Var(_)));
        }
    }
}
