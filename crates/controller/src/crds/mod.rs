pub mod fencingrequest;

pub use fencingrequest::*;
