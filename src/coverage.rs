//! Corpus replay through the instrumented target and the LLVM coverage
//! toolchain. One run produces both the function-level counters (from
//! `llvm-cov export`) and the annotated per-line source view (from
//! `llvm-cov show`); the caller decides what to do with each.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::AdvisorError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCoverage {
    pub name: String,
    pub count: u64,
    #[serde(default)]
    pub filenames: Vec<String>,
}

/// Function counters extracted from one corpus replay. `corpus_count` is the
/// number of entries in the corpus directory that produced the report, not
/// anything the toolchain emits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramCoverageData {
    #[serde(default)]
    pub functions: Vec<FunctionCoverage>,
    #[serde(skip)]
    pub corpus_count: u64,
}

#[derive(Debug, Deserialize)]
struct CoverageExport {
    #[serde(default)]
    data: Vec<ProgramCoverageData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineCov {
    pub line_number: u64,
    pub count: u64,
    pub code: String,
}

/// Annotated source of one file, dense from line 1 to N.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLineCoverage {
    pub file: String,
    pub lines: Vec<LineCov>,
}

impl FileLineCoverage {
    /// Original source text reassembled from the annotated view.
    pub fn origin_code(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for line in &self.lines {
            out.extend_from_slice(line.code.as_bytes());
            out.push(b'\n');
        }
        out
    }

    pub fn reset_cov(&mut self) {
        for line in &mut self.lines {
            line.count = 0;
        }
    }
}

/// Everything one corpus replay yields.
#[derive(Debug, Clone)]
pub struct CorpusCoverage {
    pub functions: ProgramCoverageData,
    pub lines: Vec<FileLineCoverage>,
}

/// Monotonically growing union of every report seen so far. Counts only ever
/// increase and functions are never removed, so memory is bounded by the
/// number of distinct functions in the target.
#[derive(Debug, Clone, Default)]
pub struct GlobalCoverage {
    functions: Vec<FunctionCoverage>,
    index: HashMap<String, usize>,
    pub corpus_count: u64,
}

impl GlobalCoverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, report: &ProgramCoverageData) {
        self.corpus_count += report.corpus_count;
        for fc in &report.functions {
            match self.index.get(&fc.name) {
                Some(&pos) => self.functions[pos].count += fc.count,
                None => {
                    self.index.insert(fc.name.clone(), self.functions.len());
                    self.functions.push(fc.clone());
                }
            }
        }
    }

    pub fn count_of(&self, name: &str) -> u64 {
        self.index
            .get(name)
            .map(|&pos| self.functions[pos].count)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> ProgramCoverageData {
        ProgramCoverageData {
            functions: self.functions.clone(),
            corpus_count: self.corpus_count,
        }
    }
}

/// Drives the instrumented target and the llvm tools against a corpus
/// directory. Each run works inside its own scratch directory which is
/// removed on every exit path, including panics.
#[derive(Debug, Clone)]
pub struct CoverageRunner {
    program: PathBuf,
}

impl CoverageRunner {
    pub fn new(program: &Path) -> Result<Self, AdvisorError> {
        Ok(Self {
            program: program.canonicalize()?,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn run(&self, corpus_dir: &Path) -> Result<CorpusCoverage, AdvisorError> {
        let work = tempfile::Builder::new()
            .prefix("advisor_work_")
            .tempdir()?;
        let merge_dir = work.path().join("corpus_merge");
        std::fs::create_dir(&merge_dir)?;

        let status = Command::new(&self.program)
            .arg(&merge_dir)
            .arg(corpus_dir)
            .arg("-merge=1")
            .current_dir(work.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(AdvisorError::Exec {
                command: self.program.display().to_string(),
                status,
            });
        }

        let profraw = work.path().join("default.profraw");
        if !profraw.exists() {
            return Err(AdvisorError::MissingArtifact(profraw));
        }

        run_tool(
            "llvm-profdata",
            &["merge", "-sparse", "default.profraw", "-o", "merged_cov.profdata"],
            work.path(),
        )?;

        let object = format!("-object={}", self.program.display());
        let export = run_tool(
            "llvm-cov",
            &["export", "-instr-profile", "merged_cov.profdata", object.as_str()],
            work.path(),
        )?;
        let mut functions = parse_coverage_export(&export)?;
        functions.corpus_count = std::fs::read_dir(corpus_dir)?.count() as u64;

        let show = run_tool(
            "llvm-cov",
            &[
                "show",
                "--use-color=0",
                "-instr-profile",
                "merged_cov.profdata",
                object.as_str(),
            ],
            work.path(),
        )?;
        let lines = parse_line_coverage(&show);

        Ok(CorpusCoverage { functions, lines })
    }

    /// One-off replay of a synthetic single-seed corpus. Used at startup to
    /// learn the set of instrumented source files and their text before any
    /// fuzzer has reported.
    pub fn bootstrap_line_coverage(&self) -> Result<Vec<FileLineCoverage>, AdvisorError> {
        let corpus = tempfile::Builder::new()
            .prefix("advisor_seed_")
            .tempdir()?;
        std::fs::write(corpus.path().join("seed"), "0")?;
        Ok(self.run(corpus.path())?.lines)
    }
}

fn run_tool(command: &str, args: &[&str], cwd: &Path) -> Result<String, AdvisorError> {
    let output = Command::new(command)
        .args(args)
        .current_dir(cwd)
        .stderr(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(AdvisorError::Exec {
            command: command.to_string(),
            status: output.status,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub fn parse_coverage_export(json: &str) -> Result<ProgramCoverageData, AdvisorError> {
    let export: CoverageExport = serde_json::from_str(json)?;
    if export.data.len() > 1 {
        warn!(
            "coverage export carries {} data sets, using the first",
            export.data.len()
        );
    }
    export
        .data
        .into_iter()
        .next()
        .ok_or_else(|| AdvisorError::parse("coverage export carries no data sets"))
}

/// Parses `llvm-cov show` text. A line starting with `/` opens a new file
/// section (path is everything before the first `:`); annotated lines split
/// on `|` into line number, count and source text. Malformed lines are
/// skipped and an unparseable count reads as 0.
pub fn parse_line_coverage(text: &str) -> Vec<FileLineCoverage> {
    let mut files = Vec::new();
    let mut current: Option<FileLineCoverage> = None;

    for line in text.lines() {
        if line.starts_with('/') {
            if let Some(file) = current.take() {
                files.push(finalize_file(file));
            }
            let path = line.split(':').next().unwrap_or(line).to_string();
            current = Some(FileLineCoverage {
                file: path,
                lines: Vec::new(),
            });
            continue;
        }

        let Some(file) = current.as_mut() else {
            continue;
        };
        let mut parts = line.splitn(3, '|');
        let (Some(number), Some(count), Some(code)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(line_number) = number.trim().parse::<u64>() else {
            continue;
        };
        let count = count.trim().parse::<u64>().unwrap_or(0);
        file.lines.push(LineCov {
            line_number,
            count,
            code: code.to_string(),
        });
    }
    if let Some(file) = current.take() {
        files.push(finalize_file(file));
    }
    files
}

// Lines must run dense 1..N; anything after the first gap is dropped.
fn finalize_file(mut file: FileLineCoverage) -> FileLineCoverage {
    if let Some(pos) = file
        .lines
        .iter()
        .enumerate()
        .position(|(i, line)| line.line_number != i as u64 + 1)
    {
        warn!(
            "line coverage for {} breaks at entry {} (line {}), dropping the tail",
            file.file, pos, file.lines[pos].line_number
        );
        file.lines.truncate(pos);
    }
    file
}
