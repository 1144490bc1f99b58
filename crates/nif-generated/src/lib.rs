//! Readers generated by `nifc` from `schemas/nif.json`, compiled as part of the workspace.

#[allow(
    clippy::all,
    dead_code,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_parens,
    unused_variables
)]
pub mod nif {
    include!(concat!(env!("OUT_DIR"), "/nif.rs"));
}
