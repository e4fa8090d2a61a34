use stowage_core::AppError;

const MAX_FILENAME_LENGTH: usize = 255;
const MAX_CONTENT_TYPE_LENGTH: usize = 255;

/// Strip any directory part and reject names that are empty or try to traverse paths.
pub fn sanitize_filename(filename: &str) -> Result<String, AppError> {
    let trimmed = filename.trim();
    let filename_only = trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed);

    if filename_only.contains("..") {
        return Err(AppError::InvalidInput(
            "Filename contains invalid path traversal".to_string(),
        ));
    }
    if filename_only.is_empty() || filename_only == "." {
        return Err(AppError::InvalidInput("Filename must not be empty".to_string()));
    }

    let sanitized: String = filename_only
        .chars()
        .take(MAX_FILENAME_LENGTH)
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();

    Ok(sanitized)
}

/// Lowercased extension without the dot, if the name has one.
pub fn file_extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Accept `type/subtype` media types, parameters allowed.
pub fn validate_content_type(content_type: &str) -> Result<(), AppError> {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    let valid = content_type.len() <= MAX_CONTENT_TYPE_LENGTH
        && matches!(
            essence.split_once('/'),
            Some((kind, subtype)) if !kind.is_empty()
                && !subtype.is_empty()
                && !subtype.contains('/')
                && essence.bytes().all(|b| b.is_ascii_graphic())
        );

    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "Invalid content type: {}",
            content_type
        )))
    }
}
