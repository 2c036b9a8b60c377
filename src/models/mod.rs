use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type TrackId = i64;
pub type AlbumId = i64;
pub type PlaylistId = i64;

/// Track metadata as the catalog exposes it. Embedded into queue snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    pub artist_id: Option<i64>,
    pub album: String,
    pub album_id: Option<AlbumId>,
    pub duration: i64,
    pub cover_url: Option<String>,
}

/// Parse a path identifier. Catalog ids are positive integers.
pub fn parse_id(kind: &str, raw: &str) -> Result<i64, crate::errors::AppError> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(crate::errors::AppError::Validation(format!(
            "Invalid {} id: '{}'",
            kind, raw
        ))),
    }
}
