//! spkflow core - orchestration of external speaker-modeling tools
//!
//! This crate drives chains of single-purpose external numerical programs
//! (feature extraction, GMM/UBM training, i-vector extraction, PLDA, HMM
//! alignment) and contains no statistics of its own. It provides:
//! - A streaming codec for the keyed binary archive format the tools speak
//! - Scoped temporary artifacts that are always released
//! - Linear process pipelines with captured diagnostics
//! - An accumulate/estimate refinement loop with explicit model ownership
//! - The procedure library built on top of those pieces

pub mod archive;
pub mod config;
pub mod logging;
pub mod orchestrator;
pub mod procedures;
pub mod process;
pub mod temp;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_returns_value() {
        assert!(!version().is_empty());
    }
}
