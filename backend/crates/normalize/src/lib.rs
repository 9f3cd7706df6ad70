//! Conversion of loosely typed third-party license data into the internal
//! license schema.
//!
//! Every function here is total: malformed input produces a best-effort value,
//! never a panic or an error the caller has to handle.

pub mod key;
pub mod reverse;
pub mod sanitize;
pub mod transform;

pub use key::generate_unique_key;
pub use reverse::to_external_record;
pub use sanitize::{
    coerce_countid, coerce_text_id, normalize_status, parse_date, sanitize_agents_name,
    sanitize_date, sanitize_number, sanitize_string,
};
pub use transform::{
    build_update_patch, fallback_transform, transform_full, transform_robustly, Transformed,
    TransformError, DEFAULT_PLAN, DEFAULT_PRODUCT, DEFAULT_TERM,
};
