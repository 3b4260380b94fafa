//! Filter documents, compilation and evaluation.

pub mod auto;
pub mod compiler;
pub mod definition;
pub mod mods;
pub mod predicate;
pub mod pseudo;

pub use auto::{generate_filters, ItemPriceSource, NinjaItemSource};
pub use compiler::{compile_criteria, CompileSummary, FilterCompiler};
pub use definition::{Criteria, Filter, FilterConfig, FilterDocument};
pub use predicate::{CompiledCriteria, CompiledFilter, CriterionKey};
