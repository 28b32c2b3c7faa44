//! Route handlers behind the admission layer.
//!
//! The media business endpoints are placeholders answering
//! `501 Not Implemented`; only health and API info return data.

use axum::{http::StatusCode, Json};
use serde::Serialize;

/// Version of the HTTP API, independent of the crate version.
pub const API_VERSION: &str = "1.0.0";

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

/// API info response.
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub message: &'static str,
    pub version: &'static str,
    pub service: &'static str,
}

/// Placeholder response body.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "Media Pipeline API",
    })
}

pub async fn api_info() -> Json<InfoResponse> {
    Json(InfoResponse {
        message: "Media Pipeline API",
        version: API_VERSION,
        service: "Content Moderation Pipeline",
    })
}

fn not_implemented(message: &'static str) -> (StatusCode, Json<MessageResponse>) {
    (StatusCode::NOT_IMPLEMENTED, Json(MessageResponse { message }))
}

pub async fn upload() -> (StatusCode, Json<MessageResponse>) {
    not_implemented("Upload handler not implemented yet")
}

pub async fn resume_upload() -> (StatusCode, Json<MessageResponse>) {
    not_implemented("Resume upload handler not implemented yet")
}

pub async fn upload_status() -> (StatusCode, Json<MessageResponse>) {
    not_implemented("Status handler not implemented yet")
}

pub async fn download() -> (StatusCode, Json<MessageResponse>) {
    not_implemented("Download handler not implemented yet")
}

pub async fn delete() -> (StatusCode, Json<MessageResponse>) {
    not_implemented("Delete handler not implemented yet")
}

pub async fn moderate() -> (StatusCode, Json<MessageResponse>) {
    not_implemented("Moderation handler not implemented yet")
}

pub async fn moderation_result() -> (StatusCode, Json<MessageResponse>) {
    not_implemented("Result handler not implemented yet")
}
