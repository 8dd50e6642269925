//! Generated player names.

use rand::{seq::SliceRandom, Rng};

const PREFIXES: &[&str] = &[
    "Ar", "Bel", "Cor", "Dra", "El", "Fen", "Gal", "Hal", "Ior", "Kel", "Lum", "Mor", "Nyx",
    "Or", "Pyr", "Quel", "Ral", "Sol", "Tor", "Umb", "Vel", "Xan", "Yth", "Zor",
];

const MIDDLES: &[&str] = &["a", "e", "i", "o", "u", "ae", "ia", "ou", "y"];

const SUFFIXES: &[&str] = &[
    "dor", "gar", "ion", "ith", "lan", "mir", "nar", "ros", "sar", "thas", "vex", "wyn", "x",
];

/// Builds a capitalised name from two or three syllables.
pub fn generate_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut name = String::new();
    name.push_str(pick(rng, PREFIXES));
    if rng.gen_bool(0.5) {
        name.push_str(pick(rng, MIDDLES));
    }
    name.push_str(pick(rng, SUFFIXES));
    name
}

fn pick<'a, R: Rng + ?Sized>(rng: &mut R, table: &[&'a str]) -> &'a str {
    table.choose(rng).copied().unwrap_or("")
}
