use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use common::{Ack, AddKeyRequest, JobDescriptor, JobInfo, JobState, ObjectEntry};
use glob::glob;
use serde::Deserialize;
use std::path::{Component, Path as FsPath, PathBuf};
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::state::{AppState, JobRecord};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/keys", post(add_job_key))
        .route("/api/v1/jobs/:id/end", post(end_job_input))
        .route("/api/v1/objects", get(list_objects))
        .route("/api/v1/objects/*path", put(put_object))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn lock_failed<T>(_: T) -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

/* ---------------- jobs ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobDescriptor>,
) -> Result<Json<JobInfo>, StatusCode> {
    if req.phases.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let info = JobInfo::queued(job_id.clone(), req);

    info!(
        "job {} ({}) creado con {} fases",
        job_id,
        info.name,
        info.phases.len()
    );

    let mut jobs = state.jobs.lock().map_err(lock_failed)?;
    jobs.insert(job_id, JobRecord::new(info.clone()));

    Ok(Json(info))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, StatusCode> {
    let jobs = state.jobs.lock().map_err(lock_failed)?;

    match jobs.get(&id) {
        Some(record) => Ok(Json(record.info.clone())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

// Una clave más para el job; después del fin de entrada responde 409
async fn add_job_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AddKeyRequest>,
) -> Result<Json<Ack>, StatusCode> {
    let mut jobs = state.jobs.lock().map_err(lock_failed)?;
    let record = jobs.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;

    if record.info.input_done {
        warn!("clave {} rechazada: el job {} ya cerró la entrada", req.key, id);
        return Err(StatusCode::CONFLICT);
    }

    record.info.keys += 1;
    debug!("job {}: clave {} (#{})", id, req.key, record.info.keys);

    Ok(Json(Ack { ok: true }))
}

async fn end_job_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Ack>, StatusCode> {
    let mut jobs = state.jobs.lock().map_err(lock_failed)?;
    let record = jobs.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;

    if record.info.input_done {
        return Err(StatusCode::CONFLICT);
    }

    record.info.input_done = true;
    record.info.state = JobState::Running;
    record.ended_at = Some(SystemTime::now());

    info!("job {} cerró la entrada con {} claves", id, record.info.keys);
    Ok(Json(Ack { ok: true }))
}

/* ---------------- object store ---------------- */

/// Ruta del objeto dentro de `data_dir`; None si intenta salirse.
fn object_file(data_dir: &FsPath, path: &str) -> Option<PathBuf> {
    let rel = FsPath::new(path.trim_start_matches('/'));
    let mut out = data_dir.to_path_buf();
    let mut parts = 0;

    for comp in rel.components() {
        match comp {
            Component::Normal(c) => {
                out.push(c);
                parts += 1;
            }
            Component::CurDir => {}
            _ => return None,
        }
    }

    (parts > 0).then_some(out)
}

async fn put_object(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<Json<Ack>, StatusCode> {
    let file = object_file(&state.data_dir, &path).ok_or(StatusCode::BAD_REQUEST)?;

    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            warn!("no se pudo crear {}: {}", parent.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    }
    tokio::fs::write(&file, &body).await.map_err(|e| {
        warn!("no se pudo escribir {}: {}", file.display(), e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    info!("objeto /{} guardado ({} bytes)", path.trim_start_matches('/'), body.len());
    Ok(Json(Ack { ok: true }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    prefix: String,
}

async fn list_objects(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ObjectEntry>>, StatusCode> {
    let base = if query.prefix.trim_matches('/').is_empty() {
        state.data_dir.clone()
    } else {
        object_file(&state.data_dir, &query.prefix).ok_or(StatusCode::BAD_REQUEST)?
    };

    let entries = list_under(&state.data_dir, &base);
    debug!("{} objetos bajo '{}'", entries.len(), query.prefix);
    Ok(Json(entries))
}

// Todos los archivos bajo `base`, con rutas relativas a `data_dir`
fn list_under(data_dir: &FsPath, base: &FsPath) -> Vec<ObjectEntry> {
    let pattern = format!(
        "{}/**/*",
        glob::Pattern::escape(&base.to_string_lossy())
    );
    let Ok(paths) = glob(&pattern) else {
        return Vec::new();
    };

    let mut entries: Vec<ObjectEntry> = paths
        .flatten()
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let rel = path.strip_prefix(data_dir).ok()?;
            let name = rel.file_name()?.to_string_lossy().to_string();
            let parent: Vec<String> = rel
                .parent()?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            let size = path.metadata().ok()?.len();

            Some(ObjectEntry {
                parent: if parent.is_empty() {
                    String::new()
                } else {
                    format!("/{}", parent.join("/"))
                },
                name,
                size,
            })
        })
        .collect();

    entries.sort_by_key(|e| e.path());
    entries
}
