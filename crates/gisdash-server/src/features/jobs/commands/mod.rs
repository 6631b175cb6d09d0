//! Job commands

pub mod submit;

pub use submit::{SubmitConversionCommand, SubmitError, SubmitMode, SubmitOutcome};
