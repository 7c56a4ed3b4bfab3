use std::process::Command;
use std::sync::Arc;

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};

use crate::cache::TaskCache;
use crate::config::Settings;
use crate::frontend::Frontend;
use crate::language::Language;
use crate::queue::{JudgeJob, JudgeQueue};
use crate::verdict::Verdict;

#[derive(Serialize, Deserialize, Debug)]
pub struct Submission {
    pub id: i64,
    pub language: Language,
    pub source_code: String,
    #[serde(default)]
    pub in_ongoing_contest: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TaskInfo {
    pub task_id: String,
    /// CPU seconds, fractional.
    pub time_limit: f64,
    /// Megabytes.
    pub memory_limit: u64,
    pub grader: bool,
    #[serde(default)]
    pub grader_source_code: Option<String>,
    #[serde(default)]
    pub grader_language: Option<Language>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JudgeRequest {
    pub task_info: TaskInfo,
    pub submission: Submission,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestCaseResult {
    pub subtask: u32,
    pub test_case: u32,
    pub verdict: Verdict,
    pub score: f64,
    /// Seconds, clipped to the task time limit.
    pub time_used: f64,
    /// Megabytes.
    pub memory_used: f64,
}

#[derive(Serialize)]
struct ApiResponse {
    success: bool,
}

fn respond(success: bool) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse { success })
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = respond(false);
    InternalError::from_response(err, response).into()
}

fn authorized(req: &HttpRequest, settings: &Settings) -> bool {
    req.headers()
        .get("X-Auth-Token")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|token| token == settings.secret_key)
}

#[get("/ping")]
pub async fn ping() -> impl Responder {
    respond(true)
}

/// Cache-aware enqueue: a submission whose task snapshot is current goes
/// straight onto the judge queue; anything else is parked until the update
/// worker installs a fresh snapshot.
#[post("/judge")]
pub async fn judge_handler(
    req: HttpRequest,
    settings: web::Data<Arc<Settings>>,
    cache: web::Data<Arc<TaskCache>>,
    queue: web::Data<Arc<JudgeQueue>>,
    frontend: web::Data<Frontend>,
    body: web::Json<JudgeRequest>,
) -> impl Responder {
    if !authorized(&req, &settings) {
        return respond(false);
    }

    let request = body.into_inner();
    let task_id = request.task_info.task_id.clone();

    let current_path = if settings.debug {
        // Debug deployments have no frontend to consult; trust whatever is
        // staged locally.
        cache.current_path(&task_id)
    } else {
        match cache.is_up_to_date(&frontend, &task_id, None).await {
            Ok(true) => cache.current_path(&task_id),
            Ok(false) => None,
            Err(e) => {
                log::warn!("currency check for task {task_id} failed, treating as stale: {e:#}");
                None
            }
        }
    };

    match current_path {
        Some(task_info_path) => {
            log::info!("queueing submission {} for task {task_id}", request.submission.id);
            queue.push(JudgeJob {
                request,
                task_info_path,
            });
        }
        None => {
            let scheduled = cache.park(request);
            if scheduled {
                log::info!("scheduled task info refresh for task {task_id}");
            } else {
                log::debug!("task {task_id} refresh already pending, submission parked");
            }
        }
    }

    respond(true)
}

/// Out-of-band test-data refresh hook. Runs the configured pull command in
/// the background; deployments without one get a logged no-op.
#[post("/pull_test_cases")]
pub async fn pull_test_cases_handler(
    req: HttpRequest,
    settings: web::Data<Arc<Settings>>,
) -> impl Responder {
    if !authorized(&req, &settings) {
        return respond(false);
    }

    match settings.pull_command.clone() {
        Some(argv) if !argv.is_empty() => {
            tokio::task::spawn_blocking(move || {
                let output = Command::new(&argv[0]).args(&argv[1..]).output();
                match output {
                    Ok(output) => log::info!(
                        "test case pull finished: {}{}",
                        String::from_utf8_lossy(&output.stdout),
                        String::from_utf8_lossy(&output.stderr)
                    ),
                    Err(e) => log::error!("test case pull failed to start: {e}"),
                }
            });
        }
        _ => log::info!("no pull command configured, ignoring pull_test_cases"),
    }

    respond(true)
}
