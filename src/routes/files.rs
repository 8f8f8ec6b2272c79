//! File endpoints: multipart upload into the storage root, streamed
//! download, delete. Business entities reference uploads through `file`
//! fields holding the `_files` row id.

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde_json::{json, Value};
use sqlx::Row;
use tokio_util::io::ReaderStream;

use crate::auth::authenticate;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/_files/upload", axum::routing::post(upload))
        .route(
            "/_files/{id}",
            axum::routing::get(download).delete(delete_file),
        )
}

async fn upload(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<Value>)> {
    let app = state.manager.get(&app_name).await?;
    let user = authenticate(&state, &app, &headers)?;

    let field = multipart
        .next_field()
        .await
        .map_err(|error| AppError::BadRequest(format!("Invalid multipart body: {error}")))?
        .ok_or_else(|| AppError::BadRequest("Multipart body has no file field.".to_string()))?;

    let original_name = field
        .file_name()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| "upload.bin".to_string());
    let mime_type = field
        .content_type()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let bytes = field
        .bytes()
        .await
        .map_err(|error| AppError::BadRequest(format!("Failed to read upload: {error}")))?;

    let file_id = uuid::Uuid::new_v4().to_string();
    let directory = std::path::Path::new(&state.config.storage_root).join(&app_name);
    tokio::fs::create_dir_all(&directory).await.map_err(|error| {
        tracing::error!(error = %error, "Failed to create storage directory");
        AppError::Internal("File storage is unavailable.".to_string())
    })?;
    let disk_path = directory.join(&file_id);
    tokio::fs::write(&disk_path, &bytes).await.map_err(|error| {
        tracing::error!(error = %error, "Failed to write upload");
        AppError::Internal("File storage is unavailable.".to_string())
    })?;

    let row = sqlx::query(
        "INSERT INTO _files (id, name, mime_type, size_bytes, path, created_by)
         VALUES ($1::uuid, $2, $3, $4, $5, $6::uuid)
         RETURNING row_to_json(_files.*) AS row",
    )
    .bind(&file_id)
    .bind(&original_name)
    .bind(&mime_type)
    .bind(bytes.len() as i64)
    .bind(disk_path.to_string_lossy().as_ref())
    .bind(&user.id)
    .fetch_one(&app.pool)
    .await
    .map_err(crate::repository::sql::map_db_error)?;

    let record = crate::repository::sql::read_row(&row)
        .ok_or_else(|| AppError::Internal("File record readback failed.".to_string()))?;
    Ok((StatusCode::CREATED, Json(json!({ "data": record }))))
}

async fn download(
    State(state): State<AppState>,
    Path((app_name, file_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let app = state.manager.get(&app_name).await?;
    authenticate(&state, &app, &headers)?;

    let row = load_file_row(&app.pool, &file_id).await?;
    let disk_path: String = row.try_get("path").unwrap_or_default();
    let mime_type: String = row
        .try_get("mime_type")
        .unwrap_or_else(|_| "application/octet-stream".to_string());
    let name: String = row.try_get("name").unwrap_or_else(|_| "file".to_string());

    let file = tokio::fs::File::open(&disk_path).await.map_err(|error| {
        tracing::error!(file_id, error = %error, "File missing from storage");
        AppError::NotFound("File content is missing.".to_string())
    })?;
    let stream = ReaderStream::new(file);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        )
        .body(Body::from_stream(stream))
        .map_err(|error| AppError::Internal(format!("response build failed: {error}")))
}

async fn delete_file(
    State(state): State<AppState>,
    Path((app_name, file_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let app = state.manager.get(&app_name).await?;
    authenticate(&state, &app, &headers)?;

    let row = load_file_row(&app.pool, &file_id).await?;
    let disk_path: String = row.try_get("path").unwrap_or_default();

    sqlx::query("DELETE FROM _files WHERE id = $1::uuid")
        .bind(&file_id)
        .execute(&app.pool)
        .await
        .map_err(crate::repository::sql::map_db_error)?;

    if let Err(error) = tokio::fs::remove_file(&disk_path).await {
        tracing::warn!(file_id, error = %error, "Failed to remove file from storage");
    }

    Ok(Json(json!({ "data": { "id": file_id, "deleted": true } })))
}

async fn load_file_row(pool: &sqlx::PgPool, file_id: &str) -> AppResult<sqlx::postgres::PgRow> {
    if uuid::Uuid::parse_str(file_id).is_err() {
        return Err(AppError::BadRequest("Invalid file id.".to_string()));
    }
    sqlx::query("SELECT name, mime_type, path FROM _files WHERE id = $1::uuid")
        .bind(file_id)
        .fetch_optional(pool)
        .await
        .map_err(crate::repository::sql::map_db_error)?
        .ok_or_else(|| AppError::NotFound("File not found.".to_string()))
}
