//! HTTP surface and background analysis pipeline. Two endpoints: fuzzers
//! POST their corpus and immediately get a task id back while the heavy
//! lifting happens on a detached worker; GET retrieves the current ranking,
//! personalized when the fuzzer has a score on record.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tree_sitter::Tree;
use uuid::Uuid;

use crate::analysis::{self, ConstraintGroup};
use crate::calltree::CallTree;
use crate::classifier::{self, FuzzerScore};
use crate::coverage::{CoverageRunner, FileLineCoverage, GlobalCoverage};
use crate::error::AdvisorError;
use crate::ranker;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusReport {
    pub fuzzer: String,
    pub identity: String,
    pub corpus: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RankedGroups {
    pub constraint_groups: Vec<ConstraintGroup>,
}

/// Shared service state. The call tree, syntax trees and source bytes are
/// immutable after startup; everything mutable sits behind its own lock and
/// no lock is ever held across a subprocess run.
pub struct AppState {
    runner: CoverageRunner,
    call_tree: Arc<CallTree>,
    syntax_trees: Arc<HashMap<String, Tree>>,
    sources: Arc<HashMap<String, Vec<u8>>>,
    global_cov: Mutex<GlobalCoverage>,
    groups: Mutex<Vec<ConstraintGroup>>,
    line_cov_baseline: Mutex<Vec<FileLineCoverage>>,
    fuzzer_scores: Mutex<HashMap<String, FuzzerScore>>,
}

impl AppState {
    pub fn new(
        runner: CoverageRunner,
        call_tree: Arc<CallTree>,
        syntax_trees: HashMap<String, Tree>,
        sources: HashMap<String, Vec<u8>>,
        line_cov_baseline: Vec<FileLineCoverage>,
    ) -> Self {
        Self {
            runner,
            call_tree,
            syntax_trees: Arc::new(syntax_trees),
            sources: Arc::new(sources),
            global_cov: Mutex::new(GlobalCoverage::new()),
            groups: Mutex::new(Vec::new()),
            line_cov_baseline: Mutex::new(line_cov_baseline),
            fuzzer_scores: Mutex::new(HashMap::new()),
        }
    }
}

pub fn build_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/reportCorpus", post(handle_report_corpus))
        .route("/peekResult/:fuzzer", get(handle_peek_result))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, port: u16) -> Result<(), AdvisorError> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("serving on port {port}");
    axum::serve(listener, build_routes(state)).await?;
    Ok(())
}

async fn handle_report_corpus(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CorpusReport>, JsonRejection>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    let Json(report) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::failure(format!(
                    "invalid request body: {rejection}"
                ))),
            );
        }
    };

    if report.corpus.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::failure("corpus must not be empty")),
        );
    }

    let staged = match stage_corpus(&report.corpus) {
        Ok(staged) => staged,
        Err(e) => {
            error!("failed to stage corpus from fuzzer {}: {e}", report.fuzzer);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::failure("failed to stage corpus")),
            );
        }
    };

    let task_id = Uuid::new_v4().to_string();
    info!(
        "task {task_id}: corpus report from fuzzer {} (identity {}, {} entries)",
        report.fuzzer,
        report.identity,
        report.corpus.len()
    );

    let worker_state = state.clone();
    let worker_task_id = task_id.clone();
    let fuzzer = report.fuzzer.clone();
    tokio::spawn(async move {
        let task_id = worker_task_id.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let result = process_corpus(&worker_state, &worker_task_id, &report, staged.path());
            drop(staged);
            result
        })
        .await;
        match outcome {
            Ok(Ok(())) => info!("task {task_id}: analysis complete for fuzzer {fuzzer}"),
            Ok(Err(e)) => error!("task {task_id}: analysis failed for fuzzer {fuzzer}: {e}"),
            Err(e) => error!("task {task_id}: analysis panicked for fuzzer {fuzzer}: {e}"),
        }
    });

    (
        StatusCode::OK,
        Json(ApiResponse::accepted(format!(
            "corpus report accepted, task {task_id} processing in background"
        ))),
    )
}

async fn handle_peek_result(
    State(state): State<Arc<AppState>>,
    UrlPath(fuzzer): UrlPath<String>,
) -> (StatusCode, Json<ApiResponse<RankedGroups>>) {
    let groups = state.groups.lock().await.clone();
    let score = state.fuzzer_scores.lock().await.get(&fuzzer).copied();

    let groups = match score {
        Some(score) => ranker::sort_constraint_groups(
            groups,
            &score,
            &state.call_tree,
            &state.syntax_trees,
            &state.sources,
        ),
        None => groups,
    };

    (
        StatusCode::OK,
        Json(ApiResponse::ok(
            "constraint ranking retrieved",
            RankedGroups {
                constraint_groups: groups,
            },
        )),
    )
}

/// Copies the reported corpus paths into a fresh temporary directory,
/// preserving directory structure. Directory entries have their contents
/// merged into the staging root; plain files are copied by name.
fn stage_corpus(paths: &[String]) -> std::io::Result<tempfile::TempDir> {
    let staged = tempfile::Builder::new()
        .prefix("advisor_corpus_")
        .tempdir()?;
    for path in paths {
        let source = Path::new(path);
        if source.is_dir() {
            copy_dir_recursively(source, staged.path())?;
        } else {
            let name = source
                .file_name()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, path.clone()))?;
            std::fs::copy(source, staged.path().join(name))?;
        }
    }
    Ok(staged)
}

fn copy_dir_recursively(
    source: impl AsRef<Path>,
    dest: impl AsRef<Path>,
) -> std::io::Result<()> {
    std::fs::create_dir_all(&dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let filetype = entry.file_type()?;
        if filetype.is_dir() {
            copy_dir_recursively(entry.path(), dest.as_ref().join(entry.file_name()))?;
        } else {
            std::fs::copy(entry.path(), dest.as_ref().join(entry.file_name()))?;
        }
    }
    Ok(())
}

/// The analysis pipeline behind one corpus report. Runs on a blocking worker
/// since it shells out to the target and the llvm tools. Lock discipline:
/// global coverage first (merge + snapshot, then released), then the group
/// store; the baseline and fuzzer-score locks are taken independently.
/// Failures leave whatever already merged in place.
fn process_corpus(
    state: &AppState,
    task_id: &str,
    report: &CorpusReport,
    corpus_dir: &Path,
) -> Result<(), AdvisorError> {
    let coverage = state.runner.run(corpus_dir)?;
    info!(
        "task {task_id}: coverage extracted, {} functions over {} corpus entries",
        coverage.functions.functions.len(),
        coverage.functions.corpus_count
    );

    let snapshot = {
        let mut global = state.global_cov.blocking_lock();
        global.merge(&coverage.functions);
        global.snapshot()
    };

    let groups = analysis::rank_constraint_groups(&state.call_tree, &snapshot);
    info!(
        "task {task_id}: ranking refreshed, {} constraint groups",
        groups.len()
    );
    *state.groups.blocking_lock() = groups;

    let fresh_score = {
        let mut baseline = state.line_cov_baseline.blocking_lock();
        let score = classifier::calculate_fuzzer_score(
            &coverage.lines,
            &baseline,
            &state.syntax_trees,
            &state.sources,
        );
        *baseline = coverage.lines;
        score
    };
    info!(
        "task {task_id}: fuzzer {} broke through: {fresh_score}",
        report.fuzzer
    );

    {
        let mut scores = state.fuzzer_scores.blocking_lock();
        let updated = ranker::update_score(&fresh_score, scores.get(&report.fuzzer));
        scores.insert(report.fuzzer.clone(), updated);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_response_serializes_null_data() {
        let response = ApiResponse::<()>::accepted("queued");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"], serde_json::Value::Null);
    }

    #[test]
    fn constraint_groups_use_the_wire_field_names() {
        let group = ConstraintGroup {
            group_id: "id-1".into(),
            main_function: "parse_header".into(),
            file_name: "/src/parser.c".into(),
            total_importance: 0.75,
            paths: vec![vec!["LLVMFuzzerTestOneInput".into()]],
            constraints: vec![],
        };
        let value = serde_json::to_value(RankedGroups {
            constraint_groups: vec![group],
        })
        .unwrap();

        let wire = &value["constraint_groups"][0];
        assert_eq!(wire["group_id"], "id-1");
        assert_eq!(wire["function"], "parse_header");
        assert_eq!(wire["file_name"], "/src/parser.c");
        assert_eq!(wire["importance"], 0.75);
        assert!(wire["paths"].is_array());
        // Member constraints never leave the process.
        assert!(wire.get("constraints").is_none());
    }

    #[test]
    fn stage_corpus_copies_files_and_directory_trees() {
        let corpus = tempfile::tempdir().unwrap();
        let nested = corpus.path().join("deeper");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(corpus.path().join("input_a"), b"aaaa").unwrap();
        std::fs::write(nested.join("input_b"), b"bbbb").unwrap();

        let loose = tempfile::tempdir().unwrap();
        let loose_file = loose.path().join("input_c");
        std::fs::write(&loose_file, b"cccc").unwrap();

        let staged = stage_corpus(&[
            corpus.path().to_string_lossy().into_owned(),
            loose_file.to_string_lossy().into_owned(),
        ])
        .unwrap();

        assert_eq!(
            std::fs::read(staged.path().join("input_a")).unwrap(),
            b"aaaa"
        );
        assert_eq!(
            std::fs::read(staged.path().join("deeper").join("input_b")).unwrap(),
            b"bbbb"
        );
        assert_eq!(
            std::fs::read(staged.path().join("input_c")).unwrap(),
            b"cccc"
        );
    }

    #[test]
    fn stage_corpus_propagates_missing_sources() {
        assert!(stage_corpus(&["/definitely/not/here".to_string()]).is_err());
    }

    fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        let scratch = tempfile::tempdir().unwrap();
        let fake_target = scratch.path().join("target");
        std::fs::write(&fake_target, b"").unwrap();
        let runner = CoverageRunner::new(&fake_target).unwrap();

        let index: crate::profile::ProfileIndex = [(
            "LLVMFuzzerTestOneInput".to_string(),
            Arc::new(crate::profile::FunctionProfile {
                name: "LLVMFuzzerTestOneInput".to_string(),
                ..Default::default()
            }),
        )]
        .into_iter()
        .collect();
        let tree = CallTree::parse_str("Call tree\nLLVMFuzzerTestOneInput\n", &index).unwrap();

        let state = Arc::new(AppState::new(
            runner,
            Arc::new(tree),
            HashMap::new(),
            HashMap::new(),
            Vec::new(),
        ));
        (state, scratch)
    }

    #[tokio::test]
    async fn empty_corpus_is_rejected_without_side_effects() {
        let (state, _scratch) = test_state();
        let report = CorpusReport {
            fuzzer: "afl-01".into(),
            identity: "host".into(),
            corpus: vec![],
        };
        let (status, Json(body)) =
            handle_report_corpus(State(state.clone()), Ok(Json(report))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
        assert_eq!(state.global_cov.lock().await.corpus_count, 0);
    }

    #[tokio::test]
    async fn unstageable_corpus_is_a_server_error() {
        let (state, _scratch) = test_state();
        let report = CorpusReport {
            fuzzer: "afl-01".into(),
            identity: "host".into(),
            corpus: vec!["/definitely/not/here".into()],
        };
        let (status, Json(body)) = handle_report_corpus(State(state), Ok(Json(report))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.success);
    }

    #[tokio::test]
    async fn unknown_fuzzer_reads_the_stored_ranking_verbatim() {
        let (state, _scratch) = test_state();
        let stored = vec![
            ConstraintGroup {
                group_id: "g-1".into(),
                main_function: "parse_header".into(),
                file_name: "/src/parser.c".into(),
                total_importance: 0.9,
                paths: vec![],
                constraints: vec![],
            },
            ConstraintGroup {
                group_id: "g-2".into(),
                main_function: "checksum".into(),
                file_name: "/src/checksum.c".into(),
                total_importance: 0.4,
                paths: vec![],
                constraints: vec![],
            },
        ];
        *state.groups.lock().await = stored;

        let (status, Json(body)) =
            handle_peek_result(State(state.clone()), UrlPath("stranger".into())).await;
        assert_eq!(status, StatusCode::OK);
        let groups = body.data.unwrap().constraint_groups;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group_id, "g-1");
        assert_eq!(groups[1].group_id, "g-2");

        // No intervening report: a second peek reads the same ranking.
        let (_, Json(again)) =
            handle_peek_result(State(state), UrlPath("stranger".into())).await;
        let again = again.data.unwrap().constraint_groups;
        assert_eq!(again[0].group_id, "g-1");
        assert_eq!(again[1].group_id, "g-2");
    }

    #[test]
    fn corpus_report_round_trips() {
        let body = r#"{"fuzzer": "afl-01", "identity": "host-3", "corpus": ["/tmp/corpus"]}"#;
        let report: CorpusReport = serde_json::from_str(body).unwrap();
        assert_eq!(report.fuzzer, "afl-01");
        assert_eq!(report.corpus.len(), 1);
        assert!(serde_json::from_str::<CorpusReport>(r#"{"fuzzer": 3}"#).is_err());
    }
}
