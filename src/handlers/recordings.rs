//! `GET /recordings`: list the finished artifacts.
//!
//! Returns the file names (not paths) found in the audio and video output
//! directories, each list sorted. Artifact names start with the session id
//! followed by the creation timestamp, so sorting groups a session's files.
//! A missing directory lists as empty.

use crate::error::AppResult;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct RecordingsListing {
    pub video: Vec<String>,
    pub audio: Vec<String>,
}

/// Sorted names of the regular files directly inside `dir`.
pub async fn list_file_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

pub async fn list_recordings(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    let listing = RecordingsListing {
        video: list_file_names(&config.media.video_dir).await?,
        audio: list_file_names(&config.media.audio_dir).await?,
    };

    Ok(HttpResponse::Ok().json(listing))
}
