use std::fmt::Write;

/// An interned string, used for rule names.
///
/// This is provided by the [`symbol_table`](https://crates.io/crates/symbol_table)
/// crate. A [`Symbol`] is a 4-byte wrapper around an index into a global
/// table, so it is `Copy` and cheap to compare. The table leaks its strings,
/// which is fine for the handful of rule names that go through it.
pub use symbol_table::GlobalSymbol as Symbol;

pub(crate) type BuildHasher = fxhash::FxBuildHasher;

pub(crate) type HashMap<K, V> = hashbrown::HashMap<K, V, BuildHasher>;

pub(crate) type IndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasher>;

pub(crate) type Instant = instant::Instant;

/// Write `v` in canonical form: integral values without a decimal point,
/// everything else in the shortest round-trip representation. Negative zero
/// keeps its sign since it is bitwise-distinct from zero.
pub(crate) fn write_f64(out: &mut String, v: f64) {
    if v == v.trunc() && v.is_finite() && v.abs() < 1e15 {
        if v.to_bits() == (-0.0f64).to_bits() {
            out.push_str("-0");
        } else {
            let _ = write!(out, "{}", v as i64);
        }
    } else {
        let _ = write!(out, "{}", v);
    }
}
