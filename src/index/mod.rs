//! The hash index (spec §4.4): a linearised bucket directory over tuple
//! handles, hashed by [`crate::eval::HEval`] and disambiguated within a
//! bucket by [`crate::eval::BEval`].

mod hash_helpers;
mod hash_index;

pub use hash_helpers::{bits_per_layer, num_layers};
pub use hash_index::HashIndex;
