use serde::{Deserialize, Serialize};

/// Per-submission or per-test-case judging outcome.
///
/// Serialized as the lowercase wire codes the frontend expects.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Accepted
    Ac,
    /// Compile error
    Ce,
    /// Wrong answer
    Wa,
    /// Runtime error
    Re,
    /// Time limit exceeded
    Tle,
    /// System error
    Se,
    /// Partial score (grader tasks only)
    Ps,
    /// Skipped by the ongoing-contest subtask short-circuit
    Sk,
}
