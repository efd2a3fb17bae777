//! HTTP surface over [`Gateway`].

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use crate::errors::{GatewayError, json_error};
use crate::gateway::{Gateway, Service};

#[derive(Debug, Deserialize)]
pub struct CreateHashRequest {
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateHashRequest {
    pub known_hash: String,
    pub attempt: String,
}

#[derive(Debug, Deserialize)]
pub struct ConvertPhotoRequest {
    pub filename: String,
}

#[derive(Debug, Deserialize)]
pub struct SendEmailRequest {
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub fn build_app(gateway: Gateway) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ping/:service", get(ping))
        .route("/hash", post(create_hash))
        .route("/hash/validate", post(validate_hash))
        .route("/backup/full", post(full_backup))
        .route("/backup/sql", post(sql_backup))
        .route("/photo/convert", post(convert_photo))
        .route("/email", post(send_email))
        .with_state(gateway)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn ping(State(gateway): State<Gateway>, Path(service): Path<String>) -> Response {
    let service = match service.parse::<Service>() {
        Ok(service) => service,
        Err(msg) => return json_error(StatusCode::NOT_FOUND, "unknown_service", msg),
    };
    match gateway.ping(service).await {
        Ok(()) => Json(json!({ "service": service.as_str(), "response": "pong" })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn create_hash(
    State(gateway): State<Gateway>,
    Json(req): Json<CreateHashRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let hash = gateway.create_hash(&req.password).await?;
    Ok((StatusCode::CREATED, Json(json!({ "hash": hash }))))
}

async fn validate_hash(
    State(gateway): State<Gateway>,
    Json(req): Json<ValidateHashRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let valid = gateway.validate_hash(&req.known_hash, &req.attempt).await?;
    Ok(Json(json!({ "valid": valid })))
}

async fn full_backup(State(gateway): State<Gateway>) -> Result<impl IntoResponse, GatewayError> {
    gateway.full_backup().await?;
    Ok(Json(json!({ "backup": "full", "ok": true })))
}

async fn sql_backup(State(gateway): State<Gateway>) -> Result<impl IntoResponse, GatewayError> {
    gateway.sql_backup().await?;
    Ok(Json(json!({ "backup": "sql", "ok": true })))
}

async fn convert_photo(
    State(gateway): State<Gateway>,
    Json(req): Json<ConvertPhotoRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let filename = gateway.convert_photo(&req.filename).await?;
    Ok(Json(json!({ "filename": filename })))
}

async fn send_email(
    State(gateway): State<Gateway>,
    Json(req): Json<SendEmailRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    gateway.send_email(&req.to, &req.subject, &req.body).await?;
    Ok(StatusCode::ACCEPTED)
}
