use once_cell::sync::Lazy;

use crate::matcher::Bindings;
use crate::pattern::Pattern;
use crate::rewrite::Rule;
use crate::term::{Op, TermGraph};

fn p(pid: u32) -> Pattern {
    Pattern::hole(pid)
}

fn s(pid: u32) -> Pattern {
    Pattern::spread(pid)
}

fn c(value: f64) -> Pattern {
    Pattern::lit(value)
}

fn bound_const_eq(g: &TermGraph, b: &Bindings, pid: u32, want: f64) -> bool {
    matches!(g[b[pid]].op(), Op::Const(v) if v == want)
}

fn bound_is_const(g: &TermGraph, b: &Bindings, pid: u32) -> bool {
    matches!(g[b[pid]].op(), Op::Const(_))
}

static DEFAULT_RULES: Lazy<Vec<Rule>> = Lazy::new(build);

/// The shipped rule table. Every rule is an exact algebraic identity on its
/// domain; guards restrict the ones that only hold for specific constants.
/// The table is built and validated once; each call hands out a clone
/// (rules are cheap to clone, guards are shared).
pub fn default_rules() -> Vec<Rule> {
    DEFAULT_RULES.clone()
}

fn build() -> Vec<Rule> {
    let mut rules = Vec::new();

    // sin(u)² + cos(u)² + rest -> 1 + rest
    rules.push(
        Rule::new(
            "pythagorean",
            Pattern::add_n(vec![
                p(1).sin() * p(1).sin(),
                p(1).cos() * p(1).cos(),
                s(9),
            ]),
            Pattern::add_n(vec![c(1.0), s(9)]),
            10,
        )
        .unwrap(),
    );

    rules.push(Rule::new("log_exp", p(1).exp().log(), p(1), 5).unwrap());
    rules.push(Rule::new("exp_log", p(1).log().exp(), p(1), 5).unwrap());

    // u² + 2uv + v² + rest -> (u + v)² + rest
    rules.push(
        Rule::new(
            "square_plus",
            Pattern::add_n(vec![
                p(1) * p(1),
                Pattern::mul_n(vec![p(0), p(1), p(2)]),
                p(2) * p(2),
                s(9),
            ]),
            Pattern::add_n(vec![(p(1) + p(2)).pow(c(2.0)), s(9)]),
            6,
        )
        .unwrap()
        .with_guard(|g, b| bound_const_eq(g, b, 0, 2.0)),
    );

    // u² - 2uv + v² + rest -> (u - v)² + rest, spelled with a -2 factor
    rules.push(
        Rule::new(
            "square_minus",
            Pattern::add_n(vec![
                p(1) * p(1),
                Pattern::mul_n(vec![p(0), p(1), p(2)]),
                p(2) * p(2),
                s(9),
            ]),
            Pattern::add_n(vec![(p(1) - p(2)).pow(c(2.0)), s(9)]),
            6,
        )
        .unwrap()
        .with_guard(|g, b| bound_const_eq(g, b, 0, -2.0)),
    );

    // uv + uw -> u(v + w)
    rules.push(
        Rule::new(
            "factor_common_left",
            p(1) * p(2) + p(1) * p(3),
            p(1) * (p(2) + p(3)),
            4,
        )
        .unwrap(),
    );

    // k1·u + k2·u + rest -> (k1 + k2)·u + rest, constants only
    rules.push(
        Rule::new(
            "like_terms",
            Pattern::add_n(vec![p(2) * p(1), p(3) * p(1), s(9)]),
            Pattern::add_n(vec![(p(2) + p(3)) * p(1), s(9)]),
            3,
        )
        .unwrap()
        .with_guard(|g, b| bound_is_const(g, b, 2) && bound_is_const(g, b, 3)),
    );

    rules.push(Rule::new("sin_odd", (-p(1)).sin(), -(p(1).sin()), 2).unwrap());
    rules.push(Rule::new("cos_even", (-p(1)).cos(), p(1).cos(), 2).unwrap());
    rules.push(Rule::new("log_one", c(1.0).log(), c(0.0), 2).unwrap());
    rules.push(Rule::new("exp_zero", c(0.0).exp(), c(1.0), 2).unwrap());

    rules
}
