pub mod bulk;
pub mod health;
pub mod local_storage;
pub mod storages;
pub mod upload_content;
pub mod uploads;
pub mod workspaces;

use axum::body::Body;
use axum::http::{header, HeaderMap};
use futures::TryStreamExt;
use tokio_util::io::StreamReader;

use stowage_storage::UploadReader;

/// Adapt a request body into the reader the storage layer consumes.
pub(crate) fn body_reader(body: Body) -> UploadReader {
    let stream = body.into_data_stream().map_err(std::io::Error::other);
    Box::pin(StreamReader::new(stream))
}

/// Declared body size, if the client sent a parseable `Content-Length`.
pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn body_reader_yields_the_request_bytes() {
        let mut reader = body_reader(Body::from("hello world"));
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn content_length_ignores_garbage() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(header::CONTENT_LENGTH, "12".parse().unwrap());
        assert_eq!(content_length(&headers), Some(12));
        headers.insert(header::CONTENT_LENGTH, "twelve".parse().unwrap());
        assert_eq!(content_length(&headers), None);
    }
}
