use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::AuthUser;
use crate::app::Services;
use crate::errors::AppError;
use crate::models::parse_id;
use crate::queue::{MutationResult, QueueEntryView, QueueSnapshot};

pub fn routes() -> Router<Services> {
    Router::new()
        .route("/current-queue", get(current_queue))
        .route("/add-track/{track_id}", post(add_track))
        .route("/remove-track/{track_id}", post(remove_track))
        .route("/add-playlist/{playlist_id}", post(add_playlist))
        .route("/add-album/{album_id}", post(add_album))
        .route("/clear", post(clear))
        .route("/current-track", get(current_track))
        .route("/set-current/{track_id}", post(set_current))
}

async fn current_queue(
    State(services): State<Services>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<QueueSnapshot>, AppError> {
    Ok(Json(services.queue.current_queue(user_id).await?))
}

async fn add_track(
    State(services): State<Services>,
    AuthUser(user_id): AuthUser,
    Path(track_id): Path<String>,
) -> Result<Json<MutationResult>, AppError> {
    let track_id = parse_id("track", &track_id)?;
    Ok(Json(services.queue.add_track(user_id, track_id).await?))
}

async fn remove_track(
    State(services): State<Services>,
    AuthUser(user_id): AuthUser,
    Path(track_id): Path<String>,
) -> Result<Json<MutationResult>, AppError> {
    let track_id = parse_id("track", &track_id)?;
    Ok(Json(services.queue.remove_track(user_id, track_id).await?))
}

async fn add_playlist(
    State(services): State<Services>,
    AuthUser(user_id): AuthUser,
    Path(playlist_id): Path<String>,
) -> Result<Json<MutationResult>, AppError> {
    let playlist_id = parse_id("playlist", &playlist_id)?;
    Ok(Json(services.queue.add_playlist(user_id, playlist_id).await?))
}

async fn add_album(
    State(services): State<Services>,
    AuthUser(user_id): AuthUser,
    Path(album_id): Path<String>,
) -> Result<Json<MutationResult>, AppError> {
    let album_id = parse_id("album", &album_id)?;
    Ok(Json(services.queue.add_album(user_id, album_id).await?))
}

async fn clear(
    State(services): State<Services>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<MutationResult>, AppError> {
    Ok(Json(services.queue.clear(user_id).await?))
}

async fn current_track(
    State(services): State<Services>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<QueueEntryView>, AppError> {
    Ok(Json(services.queue.current_track(user_id).await?))
}

async fn set_current(
    State(services): State<Services>,
    AuthUser(user_id): AuthUser,
    Path(track_id): Path<String>,
) -> Result<Json<MutationResult>, AppError> {
    let track_id = parse_id("track", &track_id)?;
    Ok(Json(services.queue.set_current(user_id, track_id).await?))
}
