//! Elements that can appear in SMILES strings, and the bonding rules we use to judge whether a
//! parsed molecule is plausible.

use std::fmt::{self, Display};

use crate::error::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Element {
    Hydrogen,
    Lithium,
    Boron,
    Carbon,
    Nitrogen,
    Oxygen,
    Fluorine,
    Sodium,
    Magnesium,
    Aluminum,
    Silicon,
    Phosphorus,
    Sulfur,
    Chlorine,
    Potassium,
    Calcium,
    Manganese,
    Iron,
    Copper,
    Zinc,
    Germanium,
    Arsenic,
    Selenium,
    Bromine,
    Silver,
    Tin,
    Tellurium,
    Iodine,
    Tungsten,
    Gold,
    Mercury,
    Lead,
}

impl Element {
    /// Parse an element symbol with SMILES capitalization, e.g. "C", "Cl", "Se".
    pub fn from_symbol(symbol: &str) -> Result<Self> {
        Ok(match symbol {
            "H" => Self::Hydrogen,
            "Li" => Self::Lithium,
            "B" => Self::Boron,
            "C" => Self::Carbon,
            "N" => Self::Nitrogen,
            "O" => Self::Oxygen,
            "F" => Self::Fluorine,
            "Na" => Self::Sodium,
            "Mg" => Self::Magnesium,
            "Al" => Self::Aluminum,
            "Si" => Self::Silicon,
            "P" => Self::Phosphorus,
            "S" => Self::Sulfur,
            "Cl" => Self::Chlorine,
            "K" => Self::Potassium,
            "Ca" => Self::Calcium,
            "Mn" => Self::Manganese,
            "Fe" => Self::Iron,
            "Cu" => Self::Copper,
            "Zn" => Self::Zinc,
            "Ge" => Self::Germanium,
            "As" => Self::Arsenic,
            "Se" => Self::Selenium,
            "Br" => Self::Bromine,
            "Ag" => Self::Silver,
            "Sn" => Self::Tin,
            "Te" => Self::Tellurium,
            "I" => Self::Iodine,
            "W" => Self::Tungsten,
            "Au" => Self::Gold,
            "Hg" => Self::Mercury,
            "Pb" => Self::Lead,
            _ => {
                return Err(Error::Smiles(format!("unknown element symbol '{symbol}'")));
            }
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Hydrogen => "H",
            Self::Lithium => "Li",
            Self::Boron => "B",
            Self::Carbon => "C",
            Self::Nitrogen => "N",
            Self::Oxygen => "O",
            Self::Fluorine => "F",
            Self::Sodium => "Na",
            Self::Magnesium => "Mg",
            Self::Aluminum => "Al",
            Self::Silicon => "Si",
            Self::Phosphorus => "P",
            Self::Sulfur => "S",
            Self::Chlorine => "Cl",
            Self::Potassium => "K",
            Self::Calcium => "Ca",
            Self::Manganese => "Mn",
            Self::Iron => "Fe",
            Self::Copper => "Cu",
            Self::Zinc => "Zn",
            Self::Germanium => "Ge",
            Self::Arsenic => "As",
            Self::Selenium => "Se",
            Self::Bromine => "Br",
            Self::Silver => "Ag",
            Self::Tin => "Sn",
            Self::Tellurium => "Te",
            Self::Iodine => "I",
            Self::Tungsten => "W",
            Self::Gold => "Au",
            Self::Mercury => "Hg",
            Self::Lead => "Pb",
        }
    }

    /// Allowed valences of the neutral atom, lowest first. Metals return an empty slice; we
    /// don't judge their bonding.
    pub fn valences(self) -> &'static [u8] {
        match self {
            Self::Hydrogen => &[1],
            Self::Lithium | Self::Sodium | Self::Potassium => &[1],
            Self::Boron => &[3],
            Self::Carbon => &[4],
            Self::Nitrogen => &[3, 5],
            Self::Oxygen => &[2],
            Self::Fluorine => &[1],
            Self::Silicon | Self::Germanium => &[4],
            Self::Phosphorus | Self::Arsenic => &[3, 5],
            Self::Sulfur | Self::Selenium | Self::Tellurium => &[2, 4, 6],
            Self::Chlorine | Self::Bromine | Self::Iodine => &[1, 3, 5, 7],
            Self::Tin => &[2, 4],
            _ => &[],
        }
    }

    /// The largest valence we accept, if the element has a bonding rule at all.
    pub fn max_valence(self) -> Option<u8> {
        self.valences().last().copied()
    }

    /// Elements that may be written without brackets.
    pub fn in_organic_subset(self) -> bool {
        matches!(
            self,
            Self::Boron
                | Self::Carbon
                | Self::Nitrogen
                | Self::Oxygen
                | Self::Phosphorus
                | Self::Sulfur
                | Self::Fluorine
                | Self::Chlorine
                | Self::Bromine
                | Self::Iodine
        )
    }

    /// Elements that may be written in lowercase, as a member of an aromatic ring.
    pub fn can_be_aromatic(self) -> bool {
        matches!(
            self,
            Self::Boron
                | Self::Carbon
                | Self::Nitrogen
                | Self::Oxygen
                | Self::Phosphorus
                | Self::Sulfur
                | Self::Arsenic
                | Self::Selenium
                | Self::Tellurium
        )
    }
}

impl Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}
