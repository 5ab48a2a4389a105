//! Skill packs: parsing, catalog loading, and staged disclosure.

pub mod disclosure;
pub mod parser;
pub mod registry;
