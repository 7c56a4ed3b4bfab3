use std::path::Path;

use serde::{Deserialize, Serialize};

/// Closed set of source languages the worker accepts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Cpp,
    C,
    Py,
    Ocaml,
}

impl Language {
    pub fn extension(&self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::Py => "py",
            Language::Ocaml => "ml",
        }
    }

    /// Compiler argv for compiled languages, `None` for interpreted ones.
    pub fn compile_args(&self, executable: &Path, source: &Path) -> Option<Vec<String>> {
        let executable = executable.to_string_lossy().into_owned();
        let source = source.to_string_lossy().into_owned();
        let args = match self {
            Language::Cpp => vec![
                "g++".to_string(),
                "-O2".to_string(),
                "--std=c++17".to_string(),
                "-o".to_string(),
                executable,
                source,
            ],
            Language::C => vec![
                "gcc".to_string(),
                "-O2".to_string(),
                "-o".to_string(),
                executable,
                source,
            ],
            Language::Ocaml => vec![
                "ocamlopt".to_string(),
                "-S".to_string(),
                "-o".to_string(),
                executable,
                source,
            ],
            Language::Py => return None,
        };
        Some(args)
    }

    /// Argv handed to the sandbox when executing the prepared program.
    ///
    /// Compiled programs are invoked by executable name from the box
    /// directory; interpreted ones through the system interpreter.
    pub fn run_args(&self, base_name: &str, source_filename: &str) -> Vec<String> {
        match self {
            Language::Py => vec![
                "/usr/bin/python3".to_string(),
                source_filename.to_string(),
            ],
            _ => vec![base_name.to_string()],
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn wire_names() {
        assert_eq!(serde_json::to_string(&Language::Cpp).unwrap(), "\"cpp\"");
        assert_eq!(serde_json::to_string(&Language::Ocaml).unwrap(), "\"ocaml\"");
        let lang: Language = serde_json::from_str("\"py\"").unwrap();
        assert_eq!(lang, Language::Py);
    }

    #[test]
    fn cpp_compile_command() {
        let args = Language::Cpp
            .compile_args(&PathBuf::from("run/code0"), &PathBuf::from("run/code0.cpp"))
            .unwrap();
        assert_eq!(
            args,
            vec!["g++", "-O2", "--std=c++17", "-o", "run/code0", "run/code0.cpp"]
        );
    }

    #[test]
    fn c_compile_command() {
        let args = Language::C
            .compile_args(&PathBuf::from("run/code1"), &PathBuf::from("run/code1.c"))
            .unwrap();
        assert_eq!(args, vec!["gcc", "-O2", "-o", "run/code1", "run/code1.c"]);
    }

    #[test]
    fn python_is_interpreted() {
        assert!(Language::Py.compile_args(Path::new("x"), Path::new("y")).is_none());
        assert_eq!(
            Language::Py.run_args("code0", "code0.py"),
            vec!["/usr/bin/python3", "code0.py"]
        );
    }

    #[test]
    fn compiled_run_args_use_base_name() {
        assert_eq!(Language::Ocaml.run_args("grader2", "grader2.ml"), vec!["grader2"]);
    }
}
