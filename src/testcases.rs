use std::fs;
use std::io;
use std::path::PathBuf;

/// One test case, read lazily from the staged task directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub subtask: u32,
    pub test_case: u32,
    pub input: String,
    /// Expected output; absent when the task grades through a grader.
    pub output: Option<String>,
}

/// Streams `(subtask, test_case)` pairs from files named `i.j.in` (and
/// `i.j.out` when expected outputs are required) in strict order.
///
/// Subtask `i` ends at the first missing case file; the whole iteration
/// ends when case 1 of a subtask is missing. Only the case being yielded
/// is ever held in memory.
pub struct TestCaseIter {
    dir: PathBuf,
    with_output: bool,
    subtask: u32,
    test_case: u32,
}

impl TestCaseIter {
    pub fn new(dir: PathBuf, with_output: bool) -> Self {
        Self {
            dir,
            with_output,
            subtask: 1,
            test_case: 1,
        }
    }
}

impl Iterator for TestCaseIter {
    type Item = io::Result<TestCase>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let input_path = self.dir.join(format!("{}.{}.in", self.subtask, self.test_case));
            let output_path = self.dir.join(format!("{}.{}.out", self.subtask, self.test_case));

            let present = input_path.exists() && (!self.with_output || output_path.exists());
            if !present {
                if self.test_case == 1 {
                    return None;
                }
                self.subtask += 1;
                self.test_case = 1;
                continue;
            }

            let input = match fs::read_to_string(&input_path) {
                Ok(input) => input,
                Err(e) => return Some(Err(e)),
            };
            let output = if self.with_output {
                match fs::read_to_string(&output_path) {
                    Ok(output) => Some(output),
                    Err(e) => return Some(Err(e)),
                }
            } else {
                None
            };

            let case = TestCase {
                subtask: self.subtask,
                test_case: self.test_case,
                input,
                output,
            };
            self.test_case += 1;
            return Some(Ok(case));
        }
    }
}
