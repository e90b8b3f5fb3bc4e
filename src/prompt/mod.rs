// Declare submodules
mod common;
mod verification;

pub use common::*;
pub use verification::{duplicate_verification_prompt, parse_verification_response};
