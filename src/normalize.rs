use crate::term::{Id, Node, Op, TermGraph};

/// Canonicalize a graph, returning a fresh one whose root is semantically
/// equal to the input's.
///
/// `Add`/`Mul` are flattened, constant-folded, stripped of identities and
/// sorted into the canonical child order; `Sub` is erased into addition of
/// a negation; `Div` and `Neg` trivialities fold. The pass is idempotent:
/// normalizing a normalized graph reproduces its root structure.
///
/// Works as a single sweep over the root closure in increasing id order:
/// children always precede parents, so this *is* a post-order traversal,
/// with no recursion to overflow on deep chains.
pub fn normalize(src: &TermGraph) -> TermGraph {
    let mut dst = TermGraph::default();
    if src.is_empty() {
        return dst;
    }
    let live = src.reachable();
    let mut memo: Vec<Option<Id>> = vec![None; src.len()];

    for i in 0..src.len() {
        if !live[i] {
            continue;
        }
        let id = Id::from(i);
        let node = &src[id];
        let at = |c: Id| memo[usize::from(c)].unwrap();
        let new_id = match node.op() {
            Op::Const(v) => dst.lit(v),
            Op::Var(ix) => dst.var(ix),
            Op::Add => {
                let terms: Vec<Id> = node.children().iter().map(|&c| at(c)).collect();
                norm_sum(&mut dst, &terms)
            }
            Op::Mul => {
                let factors: Vec<Id> = node.children().iter().map(|&c| at(c)).collect();
                norm_product(&mut dst, &factors)
            }
            Op::Sub => {
                let a = at(node.children()[0]);
                let b = at(node.children()[1]);
                let nb = negated(&mut dst, b);
                norm_sum(&mut dst, &[a, nb])
            }
            Op::Div => {
                let a = at(node.children()[0]);
                let b = at(node.children()[1]);
                if matches!(dst[a].op(), Op::Const(c) if c == 0.0) {
                    dst.lit(0.0)
                } else if matches!(dst[b].op(), Op::Const(c) if c == 1.0) {
                    a
                } else if dst.structural_eq(a, b) {
                    dst.lit(1.0)
                } else {
                    dst.div(a, b)
                }
            }
            Op::Neg => {
                let a = at(node.children()[0]);
                negated(&mut dst, a)
            }
            op => {
                let ch: Vec<Id> = node.children().iter().map(|&c| at(c)).collect();
                dst.add(Node::new(op, ch))
            }
        };
        memo[i] = Some(new_id);
    }

    dst.set_root(memo[usize::from(src.root())].unwrap());
    dst
}

/// `-a` with folding: constants negate in place, a double negation strips.
fn negated(dst: &mut TermGraph, a: Id) -> Id {
    match dst[a].op() {
        Op::Const(c) => dst.lit(-c),
        Op::Neg => dst[a].children()[0],
        _ => dst.neg(a),
    }
}

/// Add-normalization of an already-normalized term list: flatten nested
/// `Add`s, fold constants into one accumulator, drop a zero sum, unwrap
/// singletons, and sort the survivors.
fn norm_sum(dst: &mut TermGraph, terms: &[Id]) -> Id {
    let mut flat = Vec::with_capacity(terms.len());
    for &t in terms {
        if matches!(dst[t].op(), Op::Add) {
            flat.extend_from_slice(dst[t].children());
        } else {
            flat.push(t);
        }
    }
    let mut csum = 0.0;
    flat.retain(|&t| match dst[t].op() {
        Op::Const(c) => {
            csum += c;
            false
        }
        _ => true,
    });
    if csum != 0.0 {
        let c = dst.lit(csum);
        flat.push(c);
    }
    match flat.len() {
        0 => dst.lit(0.0),
        1 => flat[0],
        _ => {
            sort_children(dst, &mut flat);
            dst.sum(flat)
        }
    }
}

/// Mirror of [`norm_sum`] for `Mul`: identity 1, annihilator 0.
fn norm_product(dst: &mut TermGraph, factors: &[Id]) -> Id {
    let mut flat = Vec::with_capacity(factors.len());
    for &t in factors {
        if matches!(dst[t].op(), Op::Mul) {
            flat.extend_from_slice(dst[t].children());
        } else {
            flat.push(t);
        }
    }
    if flat
        .iter()
        .any(|&t| matches!(dst[t].op(), Op::Const(c) if c == 0.0))
    {
        return dst.lit(0.0);
    }
    let mut cprod = 1.0;
    flat.retain(|&t| match dst[t].op() {
        Op::Const(c) => {
            cprod *= c;
            false
        }
        _ => true,
    });
    if cprod != 1.0 {
        let c = dst.lit(cprod);
        flat.push(c);
    }
    match flat.len() {
        0 => dst.lit(1.0),
        1 => flat[0],
        _ => {
            sort_children(dst, &mut flat);
            dst.product(flat)
        }
    }
}

/// The canonical AC child order: constants, then variables, then everything
/// else by tag; ties broken by structural hash, then id. Deterministic
/// across runs because the hash is.
fn sort_children(g: &TermGraph, ids: &mut [Id]) {
    ids.sort_by_key(|&id| (g[id].op().kind_rank(), g.structural_hash(id), id));
}

/// Display-only inverse of the `Sub` erasure: rewrite a 2-child `Add` into
/// `Sub` when exactly one child is a `Neg` or a negative constant. Never
/// run this before equality checks; normalized forms are the ones compared.
pub fn denormalize_sub(src: &TermGraph) -> TermGraph {
    let mut dst = TermGraph::default();
    if src.is_empty() {
        return dst;
    }
    let live = src.reachable();
    let mut memo: Vec<Option<Id>> = vec![None; src.len()];

    for i in 0..src.len() {
        if !live[i] {
            continue;
        }
        let id = Id::from(i);
        let node = &src[id];
        let ch: Vec<Id> = node
            .children()
            .iter()
            .map(|&c| memo[usize::from(c)].unwrap())
            .collect();

        let new_id = if matches!(node.op(), Op::Add) && ch.len() == 2 {
            let negish = |g: &TermGraph, id: Id| {
                matches!(g[id].op(), Op::Neg) || matches!(g[id].op(), Op::Const(c) if c < 0.0)
            };
            match (negish(&dst, ch[0]), negish(&dst, ch[1])) {
                (false, true) => {
                    let rhs = positive_form(&mut dst, ch[1]);
                    dst.sub(ch[0], rhs)
                }
                (true, false) => {
                    let rhs = positive_form(&mut dst, ch[0]);
                    dst.sub(ch[1], rhs)
                }
                _ => dst.sum(ch),
            }
        } else {
            dst.add(Node::new(node.op(), ch))
        };
        memo[i] = Some(new_id);
    }

    dst.set_root(memo[usize::from(src.root())].unwrap());
    dst
}

fn positive_form(dst: &mut TermGraph, id: Id) -> Id {
    match dst[id].op() {
        Op::Neg => dst[id].children()[0],
        Op::Const(c) => dst.lit(-c),
        _ => unreachable!("caller checked the negative shape"),
    }
}
