//! Helpers for handling uploaded file names

/// Name recorded when an upload carries no usable file name
pub(crate) const UNKNOWN_FILENAME: &str = "unknown";

/// Normalize a path to use forward slashes
pub(crate) fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Reduce a client-supplied file name to its final component.
///
/// Browsers on some platforms send full paths such as `C:\fakepath\cat.jpg`.
pub(crate) fn upload_basename(name: &str) -> String {
    let normalized = normalize_path(name);
    match normalized.rsplit('/').next().map(str::trim) {
        Some(base) if !base.is_empty() => base.to_string(),
        _ => UNKNOWN_FILENAME.to_string(),
    }
}

/// Whether a file name could belong to an image.
///
/// Names whose extension maps to a non-image MIME type are rejected; names
/// without a recognised extension are left for the decoder to judge.
pub(crate) fn is_image_filename(name: &str) -> bool {
    match mime_guess::from_path(name).first() {
        Some(mime) => mime.type_() == mime_guess::mime::IMAGE,
        None => true,
    }
}

/// MIME type to serve a stored image under.
///
/// Taken from the file name when it names an image type, otherwise sniffed
/// from the encoded bytes.
pub(crate) fn image_mime_type(name: &str, bytes: &[u8]) -> String {
    let from_name = mime_guess::from_path(name)
        .iter()
        .find(|mime| mime.type_() == mime_guess::mime::IMAGE);
    let sniffed = || -> Option<mime_guess::Mime> {
        let format = image::guess_format(bytes).ok()?;
        let ext = format.extensions_str().first()?;
        mime_guess::from_ext(ext).first()
    };
    from_name
        .or_else(sniffed)
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}
