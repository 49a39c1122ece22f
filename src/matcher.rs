use smallvec::SmallVec;

use crate::pattern::Pattern;
use crate::term::{Id, TermGraph};

/// Captures accumulated during a match: placeholder-to-node bindings plus
/// spread-to-node-list bindings.
///
/// Stored as small linear vectors, like an e-graph substitution; patterns
/// bind a handful of placeholders, so linear scans beat hashing.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    nodes: SmallVec<[(u32, Id); 4]>,
    lists: SmallVec<[(u32, Vec<Id>); 1]>,
}

impl Bindings {
    /// Node bound to placeholder `pid`, if any.
    pub fn get(&self, pid: u32) -> Option<Id> {
        self.nodes
            .iter()
            .find_map(|&(p, id)| if p == pid { Some(id) } else { None })
    }

    /// Bind `pid` to `id`, returning any previous binding.
    pub fn insert(&mut self, pid: u32, id: Id) -> Option<Id> {
        for pair in &mut self.nodes {
            if pair.0 == pid {
                return Some(std::mem::replace(&mut pair.1, id));
            }
        }
        self.nodes.push((pid, id));
        None
    }

    /// List bound to spread `pid`, if any.
    pub fn get_list(&self, pid: u32) -> Option<&[Id]> {
        self.lists
            .iter()
            .find_map(|(p, ids)| if *p == pid { Some(ids.as_slice()) } else { None })
    }

    /// Bind spread `pid` to `ids`.
    pub fn insert_list(&mut self, pid: u32, ids: Vec<Id>) {
        for pair in &mut self.lists {
            if pair.0 == pid {
                pair.1 = ids;
                return;
            }
        }
        self.lists.push((pid, ids));
    }

    /// Panicking spread accessor, for appliers that know `pid` is bound.
    pub fn list(&self, pid: u32) -> &[Id] {
        self.get_list(pid)
            .unwrap_or_else(|| panic!("spread {} is not bound", pid))
    }
}

impl std::ops::Index<u32> for Bindings {
    type Output = Id;

    fn index(&self, pid: u32) -> &Id {
        match self.nodes.iter().find(|(p, _)| *p == pid) {
            Some((_, id)) => id,
            None => panic!("placeholder {} is not bound", pid),
        }
    }
}

/// Match `pat` against the subtree at `id`, extending `b`.
///
/// A placeholder that is already bound only matches a structurally equal
/// subtree. A spread leaf outside an AC parent degenerates to a
/// single-element list binding. On failure `b` may hold partial captures;
/// start from fresh bindings (or a snapshot) when that matters; the AC
/// search below does exactly that.
pub fn match_node(g: &TermGraph, id: Id, pat: &Pattern, b: &mut Bindings) -> bool {
    match pat {
        Pattern::Hole(pid) => match b.get(*pid) {
            Some(prev) => g.structural_eq(prev, id),
            None => {
                b.insert(*pid, id);
                true
            }
        },
        Pattern::Spread(pid) => match b.get_list(*pid) {
            Some(prev) => prev.len() == 1 && g.structural_eq(prev[0], id),
            None => {
                b.insert_list(*pid, vec![id]);
                true
            }
        },
        Pattern::Node(op, pch) => {
            let node = &g[id];
            if !op.matches(node.op()) {
                return false;
            }
            if op.is_ac() {
                return match_ac(g, id, pch, b);
            }
            if node.children().len() != pch.len() {
                return false;
            }
            node.children()
                .iter()
                .zip(pch)
                .all(|(&c, p)| match_node(g, c, p, b))
        }
    }
}

/// Match against the root of `g` with fresh bindings.
pub fn match_root(g: &TermGraph, pat: &Pattern) -> Option<Bindings> {
    let mut b = Bindings::default();
    match_node(g, g.root(), pat, &mut b).then_some(b)
}

/// Multiset match of AC pattern children against the node's children.
///
/// Fixed (non-spread) pattern children are tried most-specific-first
/// against the remaining candidates, with full backtracking over both the
/// candidate choice and the binding state. Whatever candidates survive, in
/// arena order, become the spread's list.
fn match_ac(g: &TermGraph, id: Id, pats: &[Pattern], b: &mut Bindings) -> bool {
    let kids = g[id].children();

    let mut spread = None;
    let mut fixed: Vec<&Pattern> = Vec::with_capacity(pats.len());
    for p in pats {
        if let Pattern::Spread(pid) = p {
            // at most one spread per AC pattern
            if spread.replace(*pid).is_some() {
                return false;
            }
        } else {
            fixed.push(p);
        }
    }

    if fixed.len() > kids.len() {
        return false;
    }
    if spread.is_none() && fixed.len() != kids.len() {
        return false;
    }

    // stable, so equally specific patterns keep their written order
    fixed.sort_by_key(|p| std::cmp::Reverse(p.specificity()));

    let mut used = vec![false; kids.len()];
    match_fixed(g, kids, &fixed, spread, &mut used, b, 0)
}

fn match_fixed(
    g: &TermGraph,
    kids: &[Id],
    fixed: &[&Pattern],
    spread: Option<u32>,
    used: &mut [bool],
    b: &mut Bindings,
    k: usize,
) -> bool {
    if k == fixed.len() {
        let rest: Vec<Id> = kids
            .iter()
            .zip(used.iter())
            .filter(|&(_, &u)| !u)
            .map(|(&c, _)| c)
            .collect();
        return match spread {
            None => {
                debug_assert!(rest.is_empty());
                true
            }
            Some(pid) => match b.get_list(pid) {
                Some(prev) => {
                    prev.len() == rest.len()
                        && prev
                            .iter()
                            .zip(&rest)
                            .all(|(&a, &c)| g.structural_eq(a, c))
                }
                None => {
                    b.insert_list(pid, rest);
                    true
                }
            },
        };
    }

    for r in 0..kids.len() {
        if used[r] {
            continue;
        }
        let snapshot = b.clone();
        if match_node(g, kids[r], fixed[k], b) {
            used[r] = true;
            if match_fixed(g, kids, fixed, spread, used, b, k + 1) {
                return true;
            }
            used[r] = false;
        }
        *b = snapshot;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Op;

    #[test]
    fn repeated_hole_requires_equal_subtrees() {
        let mut g = TermGraph::default();
        let x = g.var(0);
        let s1 = g.sin(x);
        let x2 = g.var(0);
        let s2 = g.sin(x2); // structurally equal, different id
        g.sum([s1, s2]);

        let pat = Pattern::add_n(vec![Pattern::hole(1), Pattern::hole(1)]);
        let b = match_root(&g, &pat).unwrap();
        assert!(g.structural_eq(b[1], s1));

        // different subtrees must not satisfy a repeated hole
        let mut h = TermGraph::default();
        let x = h.var(0);
        let s = h.sin(x);
        let c = h.cos(x);
        h.sum([s, c]);
        assert!(match_root(&h, &pat).is_none());
    }

    #[test]
    fn non_ac_matches_pairwise() {
        let mut g = TermGraph::default();
        let x = g.var(0);
        let y = g.var(1);
        g.div(x, y);

        let pat = Pattern::Node(Op::Div, vec![Pattern::hole(1), Pattern::hole(2)]);
        let b = match_root(&g, &pat).unwrap();
        assert_eq!(b[1], x);
        assert_eq!(b[2], y);

        // arity mismatch
        let bad = Pattern::Node(Op::Div, vec![Pattern::hole(1)]);
        assert!(match_root(&g, &bad).is_none());
    }

    #[test]
    fn const_pattern_matches_payload() {
        let mut g = TermGraph::default();
        let c = g.lit(2.0);
        g.log(c);

        assert!(match_root(&g, &Pattern::lit(2.0).log()).is_some());
        assert!(match_root(&g, &Pattern::lit(1.0).log()).is_none());
    }

    #[test]
    fn ac_exact_cover_without_spread() {
        let mut g = TermGraph::default();
        let x = g.var(0);
        let y = g.var(1);
        let c = g.lit(3.0);
        g.sum([x, y, c]);

        let exact = Pattern::add_n(vec![
            Pattern::lit(3.0),
            Pattern::hole(1),
            Pattern::hole(2),
        ]);
        assert!(match_root(&g, &exact).is_some());

        // two patterns cannot cover three children
        let short = Pattern::add_n(vec![Pattern::lit(3.0), Pattern::hole(1)]);
        assert!(match_root(&g, &short).is_none());
    }

    #[test]
    fn spread_captures_remainder_in_arena_order() {
        let mut g = TermGraph::default();
        let x = g.var(0);
        let y = g.var(1);
        let z = g.var(2);
        let c = g.lit(7.0);
        g.sum([x, y, z, c]);

        let pat = Pattern::add_n(vec![Pattern::lit(7.0), Pattern::spread(9)]);
        let b = match_root(&g, &pat).unwrap();
        assert_eq!(b.list(9), &[x, y, z]);
    }

    #[test]
    fn empty_spread_is_fine() {
        let mut g = TermGraph::default();
        let x = g.var(0);
        let y = g.var(1);
        g.sum([x, y]);

        let pat = Pattern::add_n(vec![
            Pattern::hole(1),
            Pattern::hole(2),
            Pattern::spread(9),
        ]);
        let b = match_root(&g, &pat).unwrap();
        assert!(b.list(9).is_empty());
    }

    #[test]
    fn spread_outside_ac_binds_single() {
        let mut g = TermGraph::default();
        let x = g.var(0);
        g.sin(x);

        let pat = Pattern::Node(Op::Sin, vec![Pattern::spread(5)]);
        let b = match_root(&g, &pat).unwrap();
        assert_eq!(b.list(5), &[x]);
    }

    #[test]
    fn backtracking_recovers_from_greedy_choice() {
        // Add(Mul(c2, x), Mul(c3, x)): ?1 must end up bound to x in both
        // products even though the first candidate binding tried may differ.
        let mut g = TermGraph::default();
        let c2 = g.lit(2.0);
        let c3 = g.lit(3.0);
        let x = g.var(0);
        let m2 = g.product([c2, x]);
        let m3 = g.product([c3, x]);
        g.sum([m2, m3]);

        let pat = Pattern::add_n(vec![
            Pattern::hole(1) * Pattern::hole(2),
            Pattern::hole(1) * Pattern::hole(3),
        ]);
        let b = match_root(&g, &pat).unwrap();
        assert!(g.structural_eq(b[1], x));
        assert!(g.structural_eq(b[2], c2) || g.structural_eq(b[2], c3));
    }

    #[test]
    fn two_spreads_never_match() {
        let mut g = TermGraph::default();
        let x = g.var(0);
        let y = g.var(1);
        g.sum([x, y]);

        let pat = Pattern::add_n(vec![Pattern::spread(1), Pattern::spread(2)]);
        assert!(match_root(&g, &pat).is_none());
    }

    #[test]
    #[should_panic(expected = "not bound")]
    fn unbound_index_panics() {
        let b = Bindings::default();
        let _ = b[42];
    }
}
