//! Read-only access to the music catalog.
//!
//! The queue only ever holds weak references (track ids) into the catalog.
//! Everything it needs to know about tracks, albums and playlists goes
//! through the [`Catalog`] trait.

use async_trait::async_trait;
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::collections::HashMap;

use crate::errors::AppError;
use crate::models::{AlbumId, PlaylistId, Track, TrackId};

/// SQLite caps bound parameters per statement.
const LOOKUP_CHUNK: usize = 500;

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Look up a single track. `None` when it does not exist.
    async fn track(&self, id: TrackId) -> Result<Option<Track>, AppError>;

    /// Batch lookup used to materialize snapshots. Missing ids are absent from the map.
    async fn tracks(&self, ids: &[TrackId]) -> Result<HashMap<TrackId, Track>, AppError>;

    /// Track ids of an album in album order. `None` when the album does not exist.
    async fn album_tracks(&self, id: AlbumId) -> Result<Option<Vec<TrackId>>, AppError>;

    /// Track ids of a playlist in playlist order. `None` when the playlist does not exist.
    async fn playlist_tracks(&self, id: PlaylistId) -> Result<Option<Vec<TrackId>>, AppError>;
}

const TRACK_COLUMNS: &str = r#"
    SELECT
        t.id, t.title,
        COALESCE(a.name, 'Unknown Artist') as artist, t.artist_id,
        COALESCE(al.title, '') as album, t.album_id,
        t.duration, al.cover_url
    FROM tracks t
    LEFT JOIN artists a ON t.artist_id = a.id
    LEFT JOIN albums al ON t.album_id = al.id
"#;

pub struct SqliteCatalog {
    pool: Pool<Sqlite>,
}

impl SqliteCatalog {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn track(&self, id: TrackId) -> Result<Option<Track>, AppError> {
        let sql = format!("{} WHERE t.id = ?", TRACK_COLUMNS);
        let track = sqlx::query_as::<_, Track>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(track)
    }

    async fn tracks(&self, ids: &[TrackId]) -> Result<HashMap<TrackId, Track>, AppError> {
        let mut found = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(TRACK_COLUMNS);
            builder.push(" WHERE t.id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let rows = builder
                .build_query_as::<Track>()
                .fetch_all(&self.pool)
                .await?;
            for track in rows {
                found.insert(track.id, track);
            }
        }

        Ok(found)
    }

    async fn album_tracks(&self, id: AlbumId) -> Result<Option<Vec<TrackId>>, AppError> {
        let exists = sqlx::query("SELECT 1 FROM albums WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM tracks WHERE album_id = ? ORDER BY COALESCE(track_number, 0) ASC, id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(rows.into_iter().map(|(id,)| id).collect()))
    }

    async fn playlist_tracks(&self, id: PlaylistId) -> Result<Option<Vec<TrackId>>, AppError> {
        let exists = sqlx::query("SELECT 1 FROM playlists WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        // Inner join drops playlist rows whose track has since left the catalog.
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT pt.track_id
            FROM playlist_tracks pt
            JOIN tracks t ON pt.track_id = t.id
            WHERE pt.playlist_id = ?
            ORDER BY pt.position ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(rows.into_iter().map(|(id,)| id).collect()))
    }
}
