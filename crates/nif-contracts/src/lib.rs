//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for format ids that appear in
//! machine-readable input and output of the schema compiler, and for the range of
//! NIF file versions the decode contract accepts.

pub const NIFSCHEMA_SCHEMA_VERSION: &str = "nifschema.schema@0.1.0";
pub const NIFSCHEMA_SCHEMA_VERSIONS_SUPPORTED: &[&str] = &[NIFSCHEMA_SCHEMA_VERSION];

pub const NIFGEN_PROJECT_SCHEMA_VERSION: &str = "nifgen.project@0.1.0";
pub const NIFGEN_PROJECT_SCHEMA_VERSIONS_SUPPORTED: &[&str] = &[NIFGEN_PROJECT_SCHEMA_VERSION];

pub const NIFC_IR_SCHEMA_VERSION: &str = "nifc.ir@0.1.0";

/// Generator name written into the banner of every emitted artifact.
pub const GENERATED_BY: &str = "nifc";

/// Oldest packed file version the decoder accepts (3.3.0.13).
pub const NIF_VERSION_MIN: u32 = 0x0303_000D;
/// Newest packed file version the decoder accepts (20.7.0.0).
pub const NIF_VERSION_MAX: u32 = 0x1407_0000;
