use std::{collections::BTreeMap, path::PathBuf};

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use landmarker_content::{landmark::load_landmark_or_template, AssetId};
use landmarker_shared::{log::info, serde_json};
use serde::Deserialize;

use crate::{error::ApiError, AppState};

type ApiResult<T> = Result<T, ApiError>;

/// Reads a file of the cache and sends it with the given headers.
async fn serve_file(path: PathBuf, content_type: &'static str, gzip: bool) -> ApiResult<Response> {
    let bytes = tokio::fs::read(&path).await?;
    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if gzip {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    Ok(response)
}

pub async fn mode(State(state): State<AppState>) -> Json<&'static str> {
    Json(state.mode.as_str())
}

pub async fn collections(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.collections.collection_ids())
}

pub async fn collection(State(state): State<AppState>, Path(collection_id): Path<String>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.collections.collection(&collection_id)?))
}

pub async fn templates(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.templates.template_ids())
}

pub async fn template(State(state): State<AppState>, Path(template_id): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(state.templates.load_template(&template_id)?))
}

pub async fn images(State(state): State<AppState>) -> Json<Vec<AssetId>> {
    Json(state.images.asset_ids())
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    asset_id: Option<String>,
}

/// Caches the image in the request body. Responds with the id of the new asset.
pub async fn upload_image(State(state): State<AppState>, Query(query): Query<UploadQuery>, body: Bytes) -> ApiResult<Json<AssetId>> {
    let asset_id = query.asset_id.unwrap_or_else(|| "upload".to_owned());
    let images = state.images.clone();
    let asset_id = tokio::task::spawn_blocking(move || images.cache_image(&asset_id, body.to_vec()))
        .await
        .map_err(|err| ApiError::new(axum::http::StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))??;
    info!("Uploaded image is served as {asset_id}");
    Ok(Json(asset_id))
}

pub async fn image_info(State(state): State<AppState>, Path(asset_id): Path<String>) -> ApiResult<Response> {
    serve_file(state.images.image_info_path(&asset_id)?, "application/json", false).await
}

pub async fn texture(State(state): State<AppState>, Path(asset_id): Path<String>) -> ApiResult<Response> {
    serve_file(state.images.texture_path(&asset_id)?, "image/jpeg", false).await
}

pub async fn thumbnail(State(state): State<AppState>, Path(asset_id): Path<String>) -> ApiResult<Response> {
    serve_file(state.images.thumbnail_path(&asset_id)?, "image/jpeg", false).await
}

pub async fn landmarks(State(state): State<AppState>) -> ApiResult<Json<BTreeMap<String, Vec<String>>>> {
    Ok(Json(state.landmarks.asset_id_to_landmark_ids()?))
}

pub async fn landmark_ids(State(state): State<AppState>, Path(asset_id): Path<String>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.landmarks.landmark_ids(&asset_id)?))
}

pub async fn landmark(
    State(state): State<AppState>,
    Path((asset_id, landmark_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let landmark = load_landmark_or_template(state.landmarks.as_ref(), state.templates.as_ref(), &asset_id, &landmark_id)?;
    Ok(Json(landmark))
}

pub async fn save_landmark(
    State(state): State<AppState>,
    Path((asset_id, landmark_id)): Path<(String, String)>,
    Json(landmark): Json<serde_json::Value>,
) -> ApiResult<Json<&'static str>> {
    state.landmarks.save_landmark(&asset_id, &landmark_id, &landmark)?;
    Ok(Json("success"))
}

pub async fn meshes(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.meshes.as_ref().map(|meshes| meshes.asset_ids()).unwrap_or_default())
}

pub async fn mesh(State(state): State<AppState>, Path(asset_id): Path<String>) -> ApiResult<Response> {
    let meshes = state
        .meshes
        .as_ref()
        .ok_or_else(|| landmarker_content::Error::NotFound(format!("mesh '{asset_id}'")))?;
    serve_file(meshes.mesh_path(&asset_id)?, "application/octet-stream", true).await
}
