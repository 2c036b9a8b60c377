//! Shared fixtures for unit tests.

use std::path::Path;

use crate::database::DatabaseManager;

pub const USER_ID: i64 = 1;
pub const OTHER_USER_ID: i64 = 2;
pub const ALBUM_ID: i64 = 10;
pub const PLAYLIST_ID: i64 = 20;
pub const TRACK_COUNT: i64 = 12;
pub const VALID_TOKEN: &str = "token-user-1";
pub const OTHER_TOKEN: &str = "token-user-2";
pub const EXPIRED_TOKEN: &str = "token-expired";

/// In-memory database with a small catalog, playlist, album and tokens.
pub async fn seeded_database() -> DatabaseManager {
    let db = DatabaseManager::in_memory()
        .await
        .expect("in-memory database");
    seed(&db).await;
    db
}

/// Same fixtures in a WAL database file under `dir`, with a full connection pool.
pub async fn seeded_file_database(dir: &Path) -> DatabaseManager {
    let db = DatabaseManager::new(&dir.join("queue.db"))
        .await
        .expect("file database");
    seed(&db).await;
    db
}

async fn seed(db: &DatabaseManager) {
    sqlx::query("INSERT INTO artists (id, name) VALUES (1, 'Test Artist')")
        .execute(&db.pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO albums (id, title, artist_id, cover_url) VALUES (?, 'Test Album', 1, 'cover.jpg')",
    )
    .bind(ALBUM_ID)
    .execute(&db.pool)
    .await
    .unwrap();

    for id in 1..=TRACK_COUNT {
        // Tracks 4..=6 belong to the album, inserted out of track-number order.
        let (album_id, track_number) = match id {
            4 => (Some(ALBUM_ID), Some(1)),
            5 => (Some(ALBUM_ID), Some(2)),
            6 => (Some(ALBUM_ID), Some(3)),
            _ => (None, None),
        };
        sqlx::query(
            "INSERT INTO tracks (id, title, artist_id, album_id, track_number, duration) VALUES (?, ?, 1, ?, ?, 180)",
        )
        .bind(id)
        .bind(format!("Track {}", id))
        .bind(album_id)
        .bind(track_number)
        .execute(&db.pool)
        .await
        .unwrap();
    }

    sqlx::query("INSERT INTO playlists (id, title) VALUES (?, 'Road Trip')")
        .bind(PLAYLIST_ID)
        .execute(&db.pool)
        .await
        .unwrap();
    for (position, track_id) in [3_i64, 1, 2].into_iter().enumerate() {
        sqlx::query("INSERT INTO playlist_tracks (playlist_id, track_id, position) VALUES (?, ?, ?)")
            .bind(PLAYLIST_ID)
            .bind(track_id)
            .bind(position as i64)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    sqlx::query("INSERT INTO auth_tokens (token, user_id, expires_at) VALUES (?, ?, NULL)")
        .bind(VALID_TOKEN)
        .bind(USER_ID)
        .execute(&db.pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO auth_tokens (token, user_id, expires_at) VALUES (?, ?, NULL)")
        .bind(OTHER_TOKEN)
        .bind(OTHER_USER_ID)
        .execute(&db.pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO auth_tokens (token, user_id, expires_at) VALUES (?, 3, 1)")
        .bind(EXPIRED_TOKEN)
        .execute(&db.pool)
        .await
        .unwrap();
}
