use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow, bail};

use crate::verdict::Verdict;

/// Extra wall-clock headroom over the CPU limit, to catch sleeping programs.
const WALL_CLOCK_MARGIN: f64 = 1.0;

/// One isolate box, exclusively owned by a single worker.
///
/// The box id equals the worker index; two workers must never share an id.
pub struct Sandbox {
    id: u32,
    box_dir: PathBuf,
}

/// Completed sandboxed run: stdout with stderr merged in, plus the exit code.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub success: bool,
}

/// Outcome of the sandbox status field, one bucket per possible value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// No status key: the program ran to completion.
    Completed,
    /// `RE` or `SG`: non-zero exit or killed by signal.
    RuntimeError,
    /// `TO`: CPU or wall clock exhausted.
    TimeLimit,
    /// Anything else, `XX` included: the sandbox itself misbehaved.
    Fault,
}

impl RunStatus {
    /// Per-test-case verdict for this status. `Fault` has no per-case
    /// verdict; the pipeline aborts the whole submission with `Se` instead.
    pub fn verdict(&self) -> Verdict {
        match self {
            RunStatus::Completed => Verdict::Ac,
            RunStatus::RuntimeError => Verdict::Re,
            RunStatus::TimeLimit => Verdict::Tle,
            RunStatus::Fault => Verdict::Se,
        }
    }
}

impl Sandbox {
    /// Cleans up any leftover box state and initializes a fresh box.
    ///
    /// The box directory is parsed from `isolate --init` stdout.
    pub fn acquire(id: u32) -> Result<Self> {
        Self::cleanup(id)?;

        let output = Command::new("isolate")
            .arg("-b")
            .arg(id.to_string())
            .arg("--silent")
            .arg("--init")
            .output()
            .map_err(|e| anyhow!("failed to spawn isolate --init: {}", e))?;

        if !output.status.success() {
            bail!("isolate --init exited with non-zero status for box {id}");
        }

        let root_dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root_dir.is_empty() {
            bail!(
                "isolate --init produced empty stdout for box {id}; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        log::debug!("sandbox {id} initialized");
        Ok(Self {
            id,
            box_dir: PathBuf::from(root_dir).join("box"),
        })
    }

    /// Releases the box. Safe to call when no box is allocated.
    pub fn cleanup(id: u32) -> Result<()> {
        let output = Command::new("isolate")
            .arg("-b")
            .arg(id.to_string())
            .arg("--silent")
            .arg("--cleanup")
            .output()
            .map_err(|e| anyhow!("failed to spawn isolate --cleanup: {}", e))?;

        if !output.status.success() {
            bail!("isolate --cleanup exited with non-zero status for box {id}");
        }
        Ok(())
    }

    /// Directory whose contents are visible inside the box.
    pub fn box_dir(&self) -> &Path {
        &self.box_dir
    }

    /// Runs `argv` inside the box, feeding `stdin` and merging stderr into
    /// the captured stdout.
    ///
    /// `time_limit` is CPU seconds; the wall limit adds [`WALL_CLOCK_MARGIN`]
    /// on top. `memory_limit` is megabytes, converted to the kilobytes
    /// isolate expects. All three are optional so graders run unbounded.
    pub fn run(
        &self,
        argv: &[String],
        stdin: &str,
        metadata_path: Option<&Path>,
        time_limit: Option<f64>,
        memory_limit: Option<u64>,
    ) -> Result<RunOutput> {
        let mut command = Command::new("isolate");
        if let Some(meta) = metadata_path {
            command.arg("-M").arg(meta);
        }
        command.arg("-b").arg(self.id.to_string());
        if let Some(limit) = time_limit {
            command.arg("-t").arg(limit.to_string());
            command.arg("-w").arg((limit + WALL_CLOCK_MARGIN).to_string());
        }
        if let Some(limit) = memory_limit {
            command.arg("-m").arg((limit * 1024).to_string());
        }
        command.args(["--stderr-to-stdout", "--silent", "--run", "--"]);
        command.args(argv);

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn isolate --run in box {}", self.id))?;

        // Feed stdin from a separate thread so a chatty program cannot
        // deadlock against a full stdout pipe.
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("child stdin unavailable"))?;
        let input = stdin.as_bytes().to_vec();
        let writer = std::thread::spawn(move || {
            let _ = child_stdin.write_all(&input);
        });

        let output = child.wait_with_output()?;
        let _ = writer.join();

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            success: output.status.success(),
        })
    }
}

/// Parses an isolate metadata file into a key/value map.
///
/// Lines split on the first `:` with surrounding whitespace trimmed; blank
/// or malformed lines and unknown keys are kept out of the caller's way
/// rather than rejected.
pub fn parse_metadata(path: &Path) -> Result<HashMap<String, String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read metadata file {}", path.display()))?;
    Ok(parse_metadata_str(&content))
}

fn parse_metadata_str(content: &str) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            metadata.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    metadata
}

/// Classifies the `status` metadata value. Total over every possible input.
pub fn classify_status(status: Option<&str>) -> RunStatus {
    match status {
        None => RunStatus::Completed,
        Some("RE") | Some("SG") => RunStatus::RuntimeError,
        Some("TO") => RunStatus::TimeLimit,
        Some(_) => RunStatus::Fault,
    }
}
