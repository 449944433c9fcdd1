//! The pure filter/options-to-SQL translator (§4.2): no I/O, no `rusqlite`
//! dependency. The runtime crate drives cursor anchor lookups and passes
//! their results into [`cursor::build_filter`] before calling [`translate`].

pub mod cache;
pub mod cursor;
pub mod param;
pub mod projection;
pub mod textsearch;
pub mod translate;

pub use cache::{Template, TemplateCache, DEFAULT_CACHE_CAPACITY};
pub use param::Param;
pub use projection::ProjectionPlan;
pub use translate::{resolve_column, translate, CompiledQuery};
