use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;

use crate::{
    error::{AppError, Result},
    models::{feedback::Feedback, record::ImageUpload},
    utils::{is_image_filename, upload_basename, UNKNOWN_FILENAME},
    AppState,
};

use super::responses::{MessageResponse, SearchResponse};

/// Multipart form fields, read in full before any validation
#[derive(Debug, Default)]
struct FormFields {
    image: Option<(String, Bytes)>,
    text: HashMap<String, String>,
}

impl FormFields {
    async fn read(mut multipart: Multipart) -> Result<Self> {
        let mut fields = Self::default();

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or("").to_string();

            if name == "image" {
                let filename = field
                    .file_name()
                    .map(upload_basename)
                    .unwrap_or_else(|| UNKNOWN_FILENAME.to_string());
                let content = field.bytes().await?;
                fields.image = Some((filename, content));
            } else if !name.is_empty() {
                let value = field.text().await?;
                fields.text.insert(name, value);
            }
        }

        Ok(fields)
    }

    fn image(&mut self) -> Result<(String, Bytes)> {
        match self.image.take() {
            Some((_, content)) if content.is_empty() => {
                Err(AppError::Validation("image file is empty".to_string()))
            }
            Some(image) => Ok(image),
            None => Err(AppError::Validation("image file is required".to_string())),
        }
    }

    fn required(&mut self, name: &str) -> Result<String> {
        match self.text.remove(name) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(AppError::Validation(format!("{} is required", name))),
        }
    }

    fn optional(&mut self, name: &str) -> Option<String> {
        self.text.remove(name).filter(|value| !value.trim().is_empty())
    }
}

/// Stores an uploaded image with its description and topic.
pub(crate) async fn upload_image(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<impl IntoResponse> {
    let mut fields = FormFields::read(multipart).await?;
    let (filename, bytes) = fields.image()?;
    let description = fields.required("description")?;
    let topic = fields.required("topic")?;

    if !is_image_filename(&filename) {
        return Err(AppError::InvalidInput(format!("{} is not an image file", filename)));
    }

    let id = state
        .pipeline
        .ingest(ImageUpload {
            filename,
            description,
            topic,
            bytes,
        })
        .await?;

    Ok(MessageResponse::created("image, description and features stored", id))
}

/// Returns the stored images most similar to the uploaded one.
pub(crate) async fn search_image(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<impl IntoResponse> {
    let mut fields = FormFields::read(multipart).await?;
    let (_, bytes) = fields.image()?;

    let results = state.pipeline.search(bytes).await?;
    if results.is_empty() {
        return Err(AppError::NotFound("no similar image found".to_string()));
    }

    Ok(Json(SearchResponse { results }))
}

/// Records a satisfaction survey submission.
pub(crate) async fn submit_form(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<impl IntoResponse> {
    let mut fields = FormFields::read(multipart).await?;
    let rate = fields.required("rate")?;
    let comment = fields.optional("comment");

    state.feedback.submit_feedback(Feedback::new(rate, comment)).await?;
    log::debug!("Stored form submission");

    Ok(MessageResponse::ok("form data received and stored"))
}
