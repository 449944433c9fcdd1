//! Text-search filter synthesis (§4.2 "textSearch"): a multi-field
//! `$contains`-style scan merged into the user's filter.

use docbase_core::filter::{FieldCondition, FieldOp, Filter};
use docbase_core::options::TextSearchOptions;

/// Builds `(fieldA LIKE %text% OR fieldB LIKE %text% OR ...)` across
/// `opts.fields`, using a case-sensitive `$contains` when
/// `opts.case_sensitive`, else a case-insensitive equivalent.
pub fn build_filter(opts: &TextSearchOptions) -> Filter {
    let branches: Vec<Filter> = opts
        .fields
        .iter()
        .map(|field| {
            let op = if opts.case_sensitive {
                FieldOp::Contains(opts.text.clone())
            } else {
                FieldOp::ILike(format!("%{}%", opts.text))
            };
            Filter::field(field.clone(), FieldCondition::single(op))
        })
        .collect();
    Filter::or(branches)
}
