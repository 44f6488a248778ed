//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract: scripts rely on them.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain           | Description                              |
//! |---------|------------------|------------------------------------------|
//! | 0       | Universal        | Success                                  |
//! | 1       | Universal        | General error (unspecified)              |
//! | 2       | Universal        | CLI usage error (bad args, missing file) |
//! | 3-9     | link             | Settings, data and training failures     |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Wire it into `link_exit_code`

use linkwise_linkage::LinkError;

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
/// Avoid using this; prefer a specific error code.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing required options.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Link (3-9)
// =============================================================================

/// Settings file could not be parsed, or the model it describes is invalid.
pub const EXIT_LINK_CONFIG: u8 = 3;

/// Input data is missing a column the model needs.
pub const EXIT_LINK_DATA: u8 = 4;

/// A blocking rule produces more candidate pairs than `max_candidate_pairs`.
pub const EXIT_LINK_BLOCKING: u8 = 5;

/// Training produced a zero u probability or a non-finite bayes factor.
pub const EXIT_LINK_DEGENERATE: u8 = 6;

/// Cannot read an input file or write the output.
pub const EXIT_LINK_IO: u8 = 7;

/// Map a LinkError to its exit code.
pub fn link_exit_code(err: &LinkError) -> u8 {
    match err {
        LinkError::ConfigParse(_) | LinkError::Configuration(_) => EXIT_LINK_CONFIG,
        LinkError::MissingColumn { .. } => EXIT_LINK_DATA,
        LinkError::BlockingExplosion { .. } => EXIT_LINK_BLOCKING,
        LinkError::DegenerateParameter(_) => EXIT_LINK_DEGENERATE,
        LinkError::Io(_) => EXIT_LINK_IO,
        LinkError::Backend(_) | LinkError::Cancelled => EXIT_ERROR,
    }
}
