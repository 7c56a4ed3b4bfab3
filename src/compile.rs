use std::fs;
use std::path::Path;
use std::process::Command;

use crate::language::Language;
use crate::sandbox::Sandbox;

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    /// The compiler exited non-zero. Recoverable: the pipeline maps it to
    /// `CE` for the submission and `SE` for the grader.
    #[error("compilation failed")]
    Compilation { log: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Writes the source under `run_dir`, compiles it when the language calls
/// for it, stages the artifact into the sandbox box directory, and returns
/// the argv the sandbox must execute.
///
/// The caller owns the sandbox lifecycle: the submission is prepared in a
/// freshly acquired box, the grader in the same box afterwards. Distinct
/// `base_name`s keep the two artifacts from clobbering each other.
pub fn prepare(
    sandbox: &Sandbox,
    language: Language,
    base_name: &str,
    code: &str,
    run_dir: &Path,
) -> Result<Vec<String>, PrepareError> {
    let source_filename = format!("{}.{}", base_name, language.extension());
    let source_path = run_dir.join(&source_filename);
    fs::write(&source_path, code)?;

    let executable_path = run_dir.join(base_name);
    if let Some(compile_args) = language.compile_args(&executable_path, &source_path) {
        let output = Command::new(&compile_args[0])
            .args(&compile_args[1..])
            .output()?;
        if !output.status.success() {
            return Err(PrepareError::Compilation {
                log: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        fs::copy(&executable_path, sandbox.box_dir().join(base_name))?;
    } else {
        fs::copy(&source_path, sandbox.box_dir().join(&source_filename))?;
    }

    Ok(language.run_args(base_name, &source_filename))
}
