use std::collections::HashSet;
use std::time::Instant;

use anyhow::Result;

use crate::cache;
use crate::compile::{self, PrepareError};
use crate::config::Settings;
use crate::frontend::Report;
use crate::queue::JudgeJob;
use crate::routes::TestCaseResult;
use crate::sandbox::{self, RunStatus, Sandbox};
use crate::testcases::TestCaseIter;
use crate::verdict::Verdict;

/// What the pipeline hands back to the worker: a single verdict when the
/// whole submission aborted, otherwise one result per test case in order.
#[derive(Debug)]
pub enum JudgeOutcome {
    Aborted(Verdict),
    Completed(Vec<TestCaseResult>),
}

impl JudgeOutcome {
    pub fn into_report(self) -> Report {
        match self {
            JudgeOutcome::Aborted(verdict) => Report::Verdict { verdict },
            JudgeOutcome::Completed(test_case_results) => Report::Cases { test_case_results },
        }
    }
}

/// Runs the full pipeline and always cleans the box up afterwards. A failed
/// cleanup poisons an otherwise fine run into a system error. Hard I/O
/// errors propagate to the worker's catch-all instead of producing a
/// verdict.
pub fn judge(job: &JudgeJob, box_id: u32, settings: &Settings) -> Result<JudgeOutcome> {
    let outcome = judge_impl(job, box_id, settings);

    if let Err(e) = Sandbox::cleanup(box_id) {
        log::error!("worker {box_id}: sandbox cleanup failed: {e:#}");
        if outcome.is_ok() {
            return Ok(JudgeOutcome::Aborted(Verdict::Se));
        }
    }
    outcome
}

fn judge_impl(job: &JudgeJob, box_id: u32, settings: &Settings) -> Result<JudgeOutcome> {
    let started = Instant::now();
    let submission = &job.request.submission;
    let metadata_path = settings.run_dir.join(format!("metadata{box_id}.txt"));

    log::info!("worker {box_id}: compiling submission {}", submission.id);
    let sandbox = Sandbox::acquire(box_id)?;
    let run_args = match compile::prepare(
        &sandbox,
        submission.language,
        &format!("code{box_id}"),
        &submission.source_code,
        &settings.run_dir,
    ) {
        Ok(args) => args,
        Err(PrepareError::Compilation { log: compiler_log }) => {
            log::info!("worker {box_id}: submission {} failed to compile", submission.id);
            log::debug!("worker {box_id}: compiler output:\n{compiler_log}");
            return Ok(JudgeOutcome::Aborted(Verdict::Ce));
        }
        Err(PrepareError::Io(e)) => return Err(e.into()),
    };

    let task_info = match cache::load_task_info(&job.task_info_path) {
        Ok(info) => info,
        Err(e) => {
            log::error!("worker {box_id}: error retrieving task info: {e:#}");
            return Ok(JudgeOutcome::Aborted(Verdict::Se));
        }
    };

    // The grader shares the box with the submission; no re-init in between,
    // and the distinct base name keeps both executables staged.
    let grader_args = if task_info.grader {
        let (Some(language), Some(source)) = (
            task_info.grader_language,
            task_info.grader_source_code.as_deref(),
        ) else {
            log::error!("worker {box_id}: task {} declares a grader without source", task_info.task_id);
            return Ok(JudgeOutcome::Aborted(Verdict::Se));
        };
        match compile::prepare(&sandbox, language, &format!("grader{box_id}"), source, &settings.run_dir)
        {
            Ok(args) => Some(args),
            Err(PrepareError::Compilation { .. }) => {
                log::error!("worker {box_id}: grader compilation error");
                return Ok(JudgeOutcome::Aborted(Verdict::Se));
            }
            Err(PrepareError::Io(e)) => return Err(e.into()),
        }
    } else {
        None
    };

    log::info!("worker {box_id}: running and judging submission {}", submission.id);
    let task_dir = settings.test_cases_dir.join(&task_info.task_id);
    let mut results = Vec::new();
    let mut skips = SubtaskSkips::default();

    for case in TestCaseIter::new(task_dir, !task_info.grader) {
        let case = case?;

        if submission.in_ongoing_contest && skips.should_skip(case.subtask) {
            results.push(skipped_result(case.subtask, case.test_case));
            continue;
        }

        let mut input = case.input;
        if !input.ends_with('\n') {
            input.push('\n');
        }

        let run = sandbox.run(
            &run_args,
            &input,
            Some(&metadata_path),
            Some(task_info.time_limit),
            Some(task_info.memory_limit),
        )?;

        let metadata = sandbox::parse_metadata(&metadata_path)?;
        let status = sandbox::classify_status(metadata.get("status").map(String::as_str));
        if status == RunStatus::Fault {
            log::error!(
                "worker {box_id}: sandbox fault, status {:?}",
                metadata.get("status")
            );
            return Ok(JudgeOutcome::Aborted(Verdict::Se));
        }

        let time_used = metadata
            .get("time")
            .and_then(|value| value.parse::<f64>().ok())
            .unwrap_or(0.0)
            .min(task_info.time_limit);
        let memory_used = metadata
            .get("max-rss")
            .and_then(|value| value.parse::<f64>().ok())
            .unwrap_or(0.0)
            / 1024.0;

        let mut result = TestCaseResult {
            subtask: case.subtask,
            test_case: case.test_case,
            verdict: status.verdict(),
            score: 0.0,
            time_used,
            memory_used,
        };

        if result.verdict == Verdict::Ac {
            let output = normalize_output(&run.stdout);

            if let Some(grader_args) = &grader_args {
                let grader_input = compose_grader_input(&input, &output);
                let grader_run = sandbox.run(grader_args, &grader_input, None, None, None)?;
                if !grader_run.success {
                    log::error!("worker {box_id}: grader exited with non-zero code");
                    return Ok(JudgeOutcome::Aborted(Verdict::Se));
                }
                match parse_grader_output(&grader_run.stdout) {
                    Some((verdict, score)) => {
                        result.verdict = verdict;
                        result.score = score;
                    }
                    None => {
                        log::error!("worker {box_id}: grader output error");
                        return Ok(JudgeOutcome::Aborted(Verdict::Se));
                    }
                }
            } else {
                let expected = normalize_output(case.output.as_deref().unwrap_or_default());
                if output == expected {
                    result.verdict = Verdict::Ac;
                    result.score = 100.0;
                } else {
                    result.verdict = Verdict::Wa;
                    result.score = 0.0;
                }
            }
        }

        if submission.in_ongoing_contest {
            skips.record(case.subtask, result.verdict);
        }
        results.push(result);
    }

    log::info!(
        "worker {box_id}: submission {} judged in {:.4}s",
        submission.id,
        started.elapsed().as_secs_f64()
    );
    Ok(JudgeOutcome::Completed(results))
}

/// Subtask short-circuit bookkeeping for ongoing-contest submissions:
/// once a subtask sees its first non-`Ac` case, every later case in that
/// subtask is skipped outright.
#[derive(Default)]
struct SubtaskSkips {
    subtasks: HashSet<u32>,
}

impl SubtaskSkips {
    fn should_skip(&self, subtask: u32) -> bool {
        self.subtasks.contains(&subtask)
    }

    /// Records a graded case. Anything short of `Ac` (partial scores
    /// included) stops the rest of the subtask.
    fn record(&mut self, subtask: u32, verdict: Verdict) {
        if verdict != Verdict::Ac {
            self.subtasks.insert(subtask);
        }
    }
}

fn skipped_result(subtask: u32, test_case: u32) -> TestCaseResult {
    TestCaseResult {
        subtask,
        test_case,
        verdict: Verdict::Sk,
        score: 0.0,
        time_used: 0.0,
        memory_used: 0.0,
    }
}

/// Canonical output form: every line right-stripped, exactly one trailing
/// newline. Idempotent, so comparing two normalized outputs is stable.
pub fn normalize_output(raw: &str) -> String {
    let mut normalized = raw
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    if !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    normalized
}

/// Grader stdin: newline count and body of the original input, then the
/// same for the submission's normalized output.
fn compose_grader_input(input: &str, output: &str) -> String {
    let input_lines = input.matches('\n').count();
    let output_lines = output.matches('\n').count();
    format!("{input_lines}\n{input}{output_lines}\n{output}")
}

/// `AC`, `WA`, or `PS <score>` with the score within [0, 100]; anything
/// else is a grader protocol violation.
fn parse_grader_output(raw: &str) -> Option<(Verdict, f64)> {
    let text = raw.trim();
    match text {
        "AC" => Some((Verdict::Ac, 100.0)),
        "WA" => Some((Verdict::Wa, 0.0)),
        _ => {
            let (tag, score) = text.split_once(char::is_whitespace)?;
            if tag != "PS" {
                return None;
            }
            let score: f64 = score.trim().parse().ok()?;
            (0.0..=100.0).contains(&score).then_some((Verdict::Ps, score))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_is_idempotent() {
        for raw in [
            "",
            "\n",
            "a",
            "a\n",
            "a  \nb\t\n",
            "a\n\nb",
            "Quadrant I",
            "trailing spaces   ",
        ] {
            let once = normalize_output(raw);
            assert_eq!(normalize_output(&once), once, "input {raw:?}");
            assert!(once.ends_with('\n'), "input {raw:?}");
        }
    }

    #[test]
    fn normalize_strips_line_ends_only() {
        assert_eq!(normalize_output("a 1  \nb 2"), "a 1\nb 2\n");
        assert_eq!(normalize_output("a\n\nb\n"), "a\n\nb\n");
        assert_eq!(normalize_output("  indented"), "  indented\n");
    }

    #[test]
    fn normalized_outputs_compare_as_expected() {
        assert_eq!(normalize_output("1 2 3"), normalize_output("1 2 3  \n"));
        assert_ne!(normalize_output("Quadrant I"), normalize_output("Quadrant II"));
    }

    #[test]
    fn grader_input_counts_newlines() {
        let input = "3 4\n";
        let output = "Quadrant I\n";
        assert_eq!(
            compose_grader_input(input, output),
            "1\n3 4\n1\nQuadrant I\n"
        );
    }

    #[test]
    fn grader_input_multiline() {
        let input = "2\n1 1\n-1 -1\n";
        let output = "Quadrant I\nQuadrant III\n";
        assert_eq!(
            compose_grader_input(input, output),
            "3\n2\n1 1\n-1 -1\n2\nQuadrant I\nQuadrant III\n"
        );
    }

    #[test]
    fn grader_output_accepting() {
        assert_eq!(parse_grader_output("AC\n"), Some((Verdict::Ac, 100.0)));
        assert_eq!(parse_grader_output("  WA  "), Some((Verdict::Wa, 0.0)));
    }

    #[test]
    fn grader_output_partial() {
        assert_eq!(parse_grader_output("PS 42.5\n"), Some((Verdict::Ps, 42.5)));
        assert_eq!(parse_grader_output("PS 0"), Some((Verdict::Ps, 0.0)));
        assert_eq!(parse_grader_output("PS 100"), Some((Verdict::Ps, 100.0)));
        assert_eq!(parse_grader_output("PS  7.25"), Some((Verdict::Ps, 7.25)));
    }

    #[test]
    fn grader_output_violations() {
        assert_eq!(parse_grader_output(""), None);
        assert_eq!(parse_grader_output("PS"), None);
        assert_eq!(parse_grader_output("PS abc"), None);
        assert_eq!(parse_grader_output("PS 101"), None);
        assert_eq!(parse_grader_output("PS -1"), None);
        assert_eq!(parse_grader_output("PS 42.5 extra"), None);
        assert_eq!(parse_grader_output("OK 50"), None);
        assert_eq!(parse_grader_output("accepted"), None);
    }

    /// Replays the pipeline's skip-decision flow over already-graded cases.
    fn replay_with_skips(graded: &[(u32, u32, Verdict)]) -> Vec<TestCaseResult> {
        let mut skips = SubtaskSkips::default();
        let mut results = Vec::new();
        for &(subtask, test_case, verdict) in graded {
            if skips.should_skip(subtask) {
                results.push(skipped_result(subtask, test_case));
                continue;
            }
            skips.record(subtask, verdict);
            results.push(TestCaseResult {
                subtask,
                test_case,
                verdict,
                score: if verdict == Verdict::Ac { 100.0 } else { 0.0 },
                time_used: 0.01,
                memory_used: 1.0,
            });
        }
        results
    }

    #[test]
    fn subtask_short_circuits_after_first_non_ac() {
        let results = replay_with_skips(&[
            (1, 1, Verdict::Ac),
            (1, 2, Verdict::Wa),
            (1, 3, Verdict::Ac),
            (1, 4, Verdict::Tle),
            (2, 1, Verdict::Ac),
            (2, 2, Verdict::Ac),
        ]);

        let verdicts: Vec<Verdict> = results.iter().map(|r| r.verdict).collect();
        assert_eq!(
            verdicts,
            vec![
                Verdict::Ac,
                Verdict::Wa,
                Verdict::Sk,
                Verdict::Sk,
                Verdict::Ac,
                Verdict::Ac,
            ]
        );
        // every case after the first non-Ac in subtask 1 is a zeroed skip
        for skipped in &results[2..4] {
            assert_eq!(skipped.verdict, Verdict::Sk);
            assert_eq!(skipped.score, 0.0);
            assert_eq!(skipped.time_used, 0.0);
            assert_eq!(skipped.memory_used, 0.0);
        }
    }

    #[test]
    fn partial_score_stops_the_rest_of_the_subtask() {
        let results = replay_with_skips(&[
            (1, 1, Verdict::Ps),
            (1, 2, Verdict::Ac),
            (2, 1, Verdict::Ac),
        ]);
        let verdicts: Vec<Verdict> = results.iter().map(|r| r.verdict).collect();
        assert_eq!(verdicts, vec![Verdict::Ps, Verdict::Sk, Verdict::Ac]);
    }

    #[test]
    fn accepted_cases_never_trigger_skips() {
        let mut skips = SubtaskSkips::default();
        for test_case in 1..=5 {
            assert!(!skips.should_skip(1), "case {test_case}");
            skips.record(1, Verdict::Ac);
        }
        assert!(!skips.should_skip(1));
    }

    #[test]
    fn aborted_outcome_becomes_single_verdict_report() {
        let report = JudgeOutcome::Aborted(Verdict::Ce).into_report();
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({"verdict": "ce"})
        );
    }
}
