//! Train a gated temporal convolutional network on SMILES strings, one character at a time, and
//! sample new molecules from it.
//!
//! The pieces, roughly in data-flow order: [`vocab`] and [`dataset`] turn SMILES into padded
//! token batches; [`model`] is the dilated causal conv stack; [`train`] fits it with
//! next-token cross-entropy and checkpoints it via [`checkpoint`]; [`sample`] draws new strings
//! and filters them with the [`smiles`] validity checker.

pub mod checkpoint;
pub mod dataset;
pub mod element;
pub mod error;
pub mod logging;
pub mod model;
pub mod sample;
pub mod smiles;
pub mod train;
pub mod vocab;

pub use error::{Error, Result};
