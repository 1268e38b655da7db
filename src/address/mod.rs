//! Address records and their storage.
//!
//! Addresses belong to the registry. Solvers only read and update the
//! fields they are allowed to touch (activity, assigned bandwidth and their
//! own private slot) through the handles kept in [`AddressTable`].

pub mod table;

pub use table::{Address, AddressId, AddressTable};
