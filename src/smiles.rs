//! Parse SMILES text into a bare atom/bond graph, and judge whether it describes a plausible
//! molecule. This is the validity check applied to generated strings: it covers syntax (branches,
//! ring closures, bracket atoms) and bonding (valence, aromatic ring membership). It makes no
//! claim of matching a full cheminformatics toolkit.

use std::{collections::HashMap, iter::Peekable, str::Chars};

use crate::{
    element::Element,
    error::{Error, Result},
};

type CharIter<'a> = Peekable<Chars<'a>>;

/// Largest formal charge magnitude accepted on a bracket atom.
const MAX_CHARGE: u32 = 15;
const MAX_ISOTOPE: u32 = 999;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BondType {
    Single,
    Double,
    Triple,
    Aromatic,
}

impl BondType {
    /// Contribution to the valence of each atom. Aromatic bonds count as single bonds; the
    /// delocalized electron is not charged against either atom.
    pub fn valence_contrib(self) -> u8 {
        match self {
            Self::Single | Self::Aromatic => 1,
            Self::Double => 2,
            Self::Triple => 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Atom {
    pub element: Element,
    /// Written lowercase.
    pub aromatic: bool,
    /// Written in brackets. Bracket atoms carry their hydrogens explicitly.
    pub bracket: bool,
    pub h_count: u8,
    pub charge: i8,
}

#[derive(Clone, Debug)]
pub struct Bond {
    pub atom_0: usize,
    pub atom_1: usize,
    pub bond_type: BondType,
}

/// Connectivity only; no coordinates.
#[derive(Clone, Debug, Default)]
pub struct MolGraph {
    pub atoms: Vec<Atom>,
    pub bonds: Vec<Bond>,
    pub adjacency_list: Vec<Vec<usize>>,
}

fn err<T>(msg: impl Into<String>) -> Result<T> {
    Err(Error::Smiles(msg.into()))
}

impl MolGraph {
    pub fn from_smiles(data: &str) -> Result<Self> {
        let mut result = Self::default();

        let mut current: Option<usize> = None;
        let mut last_bond: Option<BondType> = None;
        // (atom the branch hangs off, atom count when it opened)
        let mut branch_stack: Vec<(usize, usize)> = Vec::new();
        // ring index -> (opening atom, explicit bond type at open)
        let mut ring_map: HashMap<u32, (usize, Option<BondType>)> = HashMap::new();

        let mut chars = data.chars().peekable();

        while let Some(&ch) = chars.peek() {
            match ch {
                '-' | '=' | '#' | '$' | ':' | '/' | '\\' => {
                    if current.is_none() {
                        return err(format!("bond '{ch}' without a preceding atom"));
                    }
                    if last_bond.is_some() {
                        return err(format!("two bond symbols in a row at '{ch}'"));
                    }
                    last_bond = Some(match ch {
                        '=' => BondType::Double,
                        '#' => BondType::Triple,
                        '$' => return err("quadruple bonds are not supported"),
                        ':' => BondType::Aromatic,
                        // Stereo bonds are single bonds for connectivity purposes.
                        _ => BondType::Single,
                    });
                    chars.next();
                }

                '(' => {
                    let Some(cur) = current else {
                        return err("branch opened without a preceding atom");
                    };
                    if last_bond.is_some() {
                        return err("bond symbol before '('");
                    }
                    branch_stack.push((cur, result.atoms.len()));
                    chars.next();
                }
                ')' => {
                    let (prev, n_atoms_at_open) = branch_stack
                        .pop()
                        .ok_or_else(|| Error::Smiles("unmatched ')'".into()))?;
                    if result.atoms.len() == n_atoms_at_open {
                        return err("empty branch");
                    }
                    if last_bond.is_some() {
                        return err("branch ends with a bond symbol");
                    }
                    current = Some(prev);
                    chars.next();
                }

                '.' => {
                    if current.is_none() || last_bond.is_some() {
                        return err("misplaced '.'");
                    }
                    if !branch_stack.is_empty() {
                        return err("'.' inside a branch");
                    }
                    current = None;
                    chars.next();
                }

                // Two-digit ring closure: %NN
                '%' => {
                    chars.next();
                    let d1 = consume_digit(&mut chars)?;
                    let d2 = consume_digit(&mut chars)?;
                    result.handle_ring(d1 * 10 + d2, current, last_bond.take(), &mut ring_map)?;
                }

                '0'..='9' => {
                    chars.next();
                    let d = ch as u32 - '0' as u32;
                    result.handle_ring(d, current, last_bond.take(), &mut ring_map)?;
                }

                '[' => {
                    let atom = parse_bracket_atom(&mut chars)?;
                    let idx = result.push_atom(atom, current, last_bond.take())?;
                    current = Some(idx);
                }

                _ => match parse_organic_atom(&mut chars) {
                    Some((element, aromatic)) => {
                        let atom = Atom {
                            element,
                            aromatic,
                            bracket: false,
                            h_count: 0,
                            charge: 0,
                        };
                        let idx = result.push_atom(atom, current, last_bond.take())?;
                        current = Some(idx);
                    }
                    None => return err(format!("unrecognized character '{ch}'")),
                },
            }
        }

        if result.atoms.is_empty() {
            return err("no atoms");
        }
        if last_bond.is_some() {
            return err("ends with a bond symbol");
        }
        if current.is_none() {
            return err("ends with '.'");
        }
        if !branch_stack.is_empty() {
            return err("unclosed branch");
        }
        if !ring_map.is_empty() {
            return err("unclosed ring closure");
        }

        Ok(result)
    }

    /// Add an atom, bonding it to `prev` if present. Returns its index.
    fn push_atom(
        &mut self,
        atom: Atom,
        prev: Option<usize>,
        bond_type: Option<BondType>,
    ) -> Result<usize> {
        let idx = self.atoms.len();
        let aromatic = atom.aromatic;
        self.atoms.push(atom);
        self.adjacency_list.push(Vec::new());

        if let Some(p) = prev {
            let bt = bond_type.unwrap_or_else(|| implicit_bt(self.atoms[p].aromatic, aromatic));
            self.add_bond(p, idx, bt)?;
        }

        Ok(idx)
    }

    /// Open or close a ring-closure bond. An explicit bond symbol at either end wins; otherwise
    /// the bond is aromatic between two aromatic atoms, and single elsewhere.
    fn handle_ring(
        &mut self,
        ring_idx: u32,
        current: Option<usize>,
        explicit_bt: Option<BondType>,
        ring_map: &mut HashMap<u32, (usize, Option<BondType>)>,
    ) -> Result<()> {
        let Some(cur) = current else {
            return err("ring closure digit without a current atom");
        };

        match ring_map.remove(&ring_idx) {
            Some((other, bt_open)) => {
                if other == cur {
                    return err(format!("ring {ring_idx} closes on its own atom"));
                }
                if let (Some(a), Some(b)) = (explicit_bt, bt_open) {
                    if a != b {
                        return err(format!("conflicting bond types on ring {ring_idx}"));
                    }
                }
                let bond_type = explicit_bt.or(bt_open).unwrap_or_else(|| {
                    implicit_bt(self.atoms[other].aromatic, self.atoms[cur].aromatic)
                });
                self.add_bond(cur, other, bond_type)?;
            }
            None => {
                ring_map.insert(ring_idx, (cur, explicit_bt));
            }
        }

        Ok(())
    }

    fn add_bond(&mut self, a: usize, b: usize, bond_type: BondType) -> Result<()> {
        if self.adjacency_list[a].contains(&b) {
            return err(format!("duplicate bond between atoms {a} and {b}"));
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        self.bonds.push(Bond {
            atom_0: lo,
            atom_1: hi,
            bond_type,
        });
        self.adjacency_list[a].push(b);
        self.adjacency_list[b].push(a);
        Ok(())
    }

    /// Sum of bond valence contributions, plus any hydrogens written in brackets.
    pub fn valence(&self, atom_i: usize) -> u32 {
        let bonded: u32 = self
            .bonds
            .iter()
            .filter(|b| b.atom_0 == atom_i || b.atom_1 == atom_i)
            .map(|b| b.bond_type.valence_contrib() as u32)
            .sum();
        bonded + self.atoms[atom_i].h_count as u32
    }

    fn aromatic_bond_count(&self, atom_i: usize) -> usize {
        self.bonds
            .iter()
            .filter(|b| {
                b.bond_type == BondType::Aromatic && (b.atom_0 == atom_i || b.atom_1 == atom_i)
            })
            .count()
    }

    /// Check bonding: no atom exceeds its largest valence (widened by its formal charge), and
    /// every aromatic atom sits in an aromatic system.
    pub fn check_bonding(&self) -> Result<()> {
        for (i, atom) in self.atoms.iter().enumerate() {
            if let Some(max) = atom.element.max_valence() {
                let allowed = max as u32 + atom.charge.unsigned_abs() as u32;
                let valence = self.valence(i);
                if valence > allowed {
                    return err(format!(
                        "{} at position {i} has valence {valence}; at most {allowed} allowed",
                        atom.element
                    ));
                }
            }

            if atom.aromatic && self.aromatic_bond_count(i) < 2 {
                return err(format!(
                    "aromatic {} at position {i} is not part of an aromatic ring",
                    atom.element
                ));
            }
        }
        Ok(())
    }
}

/// In SMILES, the implicit bond between two aromatic atoms is aromatic; otherwise
/// it is single.
fn implicit_bt(prev_aromatic: bool, new_aromatic: bool) -> BondType {
    if prev_aromatic && new_aromatic {
        BondType::Aromatic
    } else {
        BondType::Single
    }
}

/// Parse a bracket atom `[isotope? symbol chirality? Hcount? charge? :map?]`. The leading `[`
/// must still be in the iterator.
fn parse_bracket_atom(chars: &mut CharIter) -> Result<Atom> {
    chars.next(); // '['

    if let Some(isotope) = consume_number(chars) {
        if isotope > MAX_ISOTOPE {
            return err(format!("isotope {isotope} out of range"));
        }
    }

    let first = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => c,
        other => return err(format!("expected an element in bracket atom, found {other:?}")),
    };
    let aromatic = first.is_ascii_lowercase();
    let mut sym = String::from(first.to_ascii_uppercase());

    // Second letter, e.g. 'l' in Cl, or 'e' in aromatic "se".
    if let Some(&c) = chars.peek() {
        if c.is_ascii_lowercase() {
            let mut two = sym.clone();
            two.push(c);
            if Element::from_symbol(&two).is_ok() {
                chars.next();
                sym = two;
            }
        }
    }

    let element = Element::from_symbol(&sym)?;
    if aromatic && !element.can_be_aromatic() {
        return err(format!("{element} can't be aromatic"));
    }

    // Chirality: @ or @@
    while chars.peek() == Some(&'@') {
        chars.next();
    }

    let mut h_count = 0;
    if chars.peek() == Some(&'H') {
        chars.next();
        h_count = match consume_number(chars) {
            Some(n) => u8::try_from(n)
                .map_err(|_| Error::Smiles(format!("hydrogen count {n} out of range")))?,
            None => 1,
        };
    }

    let mut charge: i8 = 0;
    if let Some(&sign_char) = chars.peek() {
        if sign_char == '+' || sign_char == '-' {
            chars.next();
            let mut magnitude: u32 = 1;
            if let Some(n) = consume_number(chars) {
                magnitude = n;
            } else {
                // "++" and "--"
                while chars.peek() == Some(&sign_char) {
                    chars.next();
                    magnitude = magnitude.saturating_add(1);
                }
            }
            if magnitude > MAX_CHARGE {
                return err(format!("charge {sign_char}{magnitude} out of range"));
            }
            // Bounded above, so the cast is exact.
            let magnitude = magnitude as i8;
            charge = if sign_char == '+' { magnitude } else { -magnitude };
        }
    }

    // Atom map
    if chars.peek() == Some(&':') {
        chars.next();
        if consume_number(chars).is_none() {
            return err("atom map without a number");
        }
    }

    match chars.next() {
        Some(']') => {}
        other => return err(format!("expected ']' to close bracket atom, found {other:?}")),
    }

    Ok(Atom {
        element,
        aromatic,
        bracket: true,
        h_count,
        charge,
    })
}

/// Parse an organic-subset atom (no brackets), advancing past it. Returns `None` for anything
/// else.
fn parse_organic_atom(chars: &mut CharIter) -> Option<(Element, bool)> {
    let first = *chars.peek()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }

    // Longest match: "Cl" and "Br" before "C" and "B".
    if first.is_ascii_uppercase() {
        let mut ahead = chars.clone();
        ahead.next();
        if let Some(second) = ahead.next().filter(|c| c.is_ascii_lowercase()) {
            let two: String = [first, second].into_iter().collect();
            if let Ok(element) = Element::from_symbol(&two) {
                if element.in_organic_subset() {
                    *chars = ahead;
                    return Some((element, false));
                }
            }
        }
    }

    let aromatic = first.is_ascii_lowercase();
    let element = Element::from_symbol(&first.to_ascii_uppercase().to_string()).ok()?;
    if !element.in_organic_subset() || (aromatic && !element.can_be_aromatic()) {
        return None;
    }

    chars.next();
    Some((element, aromatic))
}

/// Consume a single ASCII digit, returning its value.
fn consume_digit(chars: &mut CharIter) -> Result<u32> {
    match chars.next() {
        Some(c) if c.is_ascii_digit() => Ok(c as u32 - '0' as u32),
        Some(c) => err(format!("expected digit after '%', found '{c}'")),
        None => err("expected digit after '%', found end of input"),
    }
}

/// Consume a run of digits, if present.
fn consume_number(chars: &mut CharIter) -> Option<u32> {
    let mut value: Option<u32> = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        chars.next();
        value = Some(value.unwrap_or(0).saturating_mul(10).saturating_add(d));
    }
    value
}

/// Parse and check bonding. Any failure, however malformed the input, is reported as `false`.
pub fn is_valid_smiles(s: &str) -> bool {
    MolGraph::from_smiles(s)
        .and_then(|mol| mol.check_bonding())
        .is_ok()
}

/// Decides whether a generated string is a well-formed molecule.
pub trait ValidityOracle {
    fn is_valid(&self, smiles: &str) -> bool;
}

/// The built-in oracle, backed by [`is_valid_smiles`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SmilesValidator;

impl ValidityOracle for SmilesValidator {
    fn is_valid(&self, smiles: &str) -> bool {
        is_valid_smiles(smiles)
    }
}

impl<F: Fn(&str) -> bool> ValidityOracle for F {
    fn is_valid(&self, smiles: &str) -> bool {
        self(smiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_molecules() {
        for smi in [
            "C",
            "CCO",
            "c1ccccc1",
            "CC(=O)Oc1ccccc1C(=O)O",       // Aspirin
            "Cn1cnc2c1c(=O)n(C)c(=O)n2C",   // Caffeine
            "c1ccc2ccccc2c1",               // Naphthalene
            "c1cc[nH]c1",                   // Pyrrole
            "C1CC1",
            "O=C=O",
            "C#N",
            "[Na+].[Cl-]",
            "C[N+](C)(C)C",
            "c1ccc(-c2ccccc2)cc1",
            "c1csc(-c2cccs2)c1",            // Bithiophene
            "C[Si](C)(C)C",
            "c1ccc2c(c1)[se]c1ccccc12",
            "F/C=C/F",
            "C%10CC%10",
            "[13CH4]",
        ] {
            assert!(is_valid_smiles(smi), "{smi} should be valid");
        }
    }

    #[test]
    fn rejects_malformed() {
        for smi in [
            "",
            "C(",
            "C)",
            "C()C",
            "C1CC",
            "C=",
            "=C",
            "CC..C",
            "C.",
            "C==C",
            "[C",
            "[Xx]",
            "Q",
            "C11",
            "&CC",
            "CC\n",
            "(C)C",
            "[C-128]",
        ] {
            assert!(!is_valid_smiles(smi), "{smi:?} should be invalid");
        }

        let many_signs = format!("[C{}]", "+".repeat(200));
        assert!(!SmilesValidator.is_valid(&many_signs));
    }

    #[test]
    fn unbracketed_atoms_are_the_organic_subset() {
        for smi in ["CCl", "ClCBr", "BrC=O", "CB(C)C", "FC(F)(F)I", "CSC", "CP(C)C", "c1ccncc1"] {
            assert!(is_valid_smiles(smi), "{smi:?} should be valid");
        }
        // Outside the subset these need brackets.
        for smi in ["CNa", "H", "Fe", "CSi(C)(C)C", "K", "f1ccccc1", "i"] {
            assert!(!is_valid_smiles(smi), "{smi:?} should be invalid");
        }

        let mol = MolGraph::from_smiles("BrCCl").unwrap();
        let elements: Vec<_> = mol.atoms.iter().map(|a| a.element).collect();
        assert_eq!(elements, [Element::Bromine, Element::Carbon, Element::Chlorine]);
    }

    #[test]
    fn bracket_numbers_out_of_range() {
        for smi in [
            "[C+16]",
            "[C-16]",
            "[C+128]",
            "[C-128]",
            "[C+4294967296]",
            "[CH256](C)(C)(C)C",
            "[CH99999999999]",
            "[1000C]",
            "[99999999999999999999C]",
        ] {
            assert!(!is_valid_smiles(smi), "{smi:?} should be invalid");
        }

        let many_minus = format!("[O{}]", "-".repeat(300));
        assert!(!is_valid_smiles(&many_minus));

        // Still in range.
        assert!(is_valid_smiles("[13CH4]"));
        assert!(is_valid_smiles("[Fe+15]"));
        assert!(is_valid_smiles("[O---]"));
        assert!(!is_valid_smiles("[CH5]"));
    }

    #[test]
    fn rejects_bad_bonding() {
        // Five-valent carbon
        assert!(!is_valid_smiles("C(C)(C)(C)(C)C"));
        assert!(!is_valid_smiles("CC(=O)(=O)C"));
        assert!(!is_valid_smiles("O=O=O"));
        // Aromatic atom outside a ring
        assert!(!is_valid_smiles("cC"));
        // Duplicate bond via ring closure
        assert!(!is_valid_smiles("C12CC12"));
    }

    #[test]
    fn charge_widens_valence() {
        assert!(is_valid_smiles("C[N+](C)(C)C"));
        assert!(!is_valid_smiles("CN(C)(C)(C)(C)C"));
    }

    #[test]
    fn graph_connectivity() {
        let mol = MolGraph::from_smiles("CC(=O)O").unwrap();
        assert_eq!(mol.atoms.len(), 4);
        assert_eq!(mol.bonds.len(), 3);
        assert_eq!(mol.adjacency_list[1].len(), 3);
        assert_eq!(mol.bonds[1].bond_type, BondType::Double);
        assert_eq!(mol.valence(1), 4);

        let benzene = MolGraph::from_smiles("c1ccccc1").unwrap();
        assert_eq!(benzene.bonds.len(), 6);
        assert!(
            benzene
                .bonds
                .iter()
                .all(|b| b.bond_type == BondType::Aromatic)
        );
    }

    #[test]
    fn closures_are_oracles() {
        let oracle = |s: &str| s.len() > 2;
        assert!(oracle.is_valid("CCC"));
        assert!(!oracle.is_valid("C"));
        assert!(SmilesValidator.is_valid("CCO"));
    }
}
