//! Host file access primitives.

mod open;

pub use open::{VerifiedFile, VerifiedOpenOptions, open_verified, same_file};
