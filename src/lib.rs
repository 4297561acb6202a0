//! Workspace root crate.
//!
//! Exists to anchor workspace-wide tooling (cargo-husky git hooks). All
//! functionality lives in the `crates/*` members.
