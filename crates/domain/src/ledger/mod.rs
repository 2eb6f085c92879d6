//! Seams to the external ledger and to the store that remembers how far it
//! has been persisted.

mod traits;

pub use traits::*;
