// Photo upload to the backend's HTTP API
//
// Best-effort and at-most-once: callers log failures and move on.

use crate::protocol::PhotoDto;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::multipart;
use std::time::Duration;
use thiserror::Error;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("HTTP client error: {0}")]
    Client(String),

    #[error("Upload request failed: {0}")]
    Request(String),

    #[error("Upload rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid upload response: {0}")]
    InvalidResponse(String),
}

/// One photo to upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Full endpoint, `{server}/api/v1/photos/upload`
    pub url: String,
    pub device_id: String,
    pub device_token: String,
    pub timestamp: DateTime<Utc>,
    pub image: Vec<u8>,
}

impl UploadRequest {
    /// ISO-8601 instant, e.g. `2024-05-01T12:00:00.123Z`
    pub fn timestamp_param(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

#[async_trait]
pub trait PhotoUploader: Send + Sync {
    async fn upload(&self, request: UploadRequest) -> Result<PhotoDto, UploadError>;
}

/// Multipart POST with the device token header
pub struct HttpPhotoUploader {
    client: reqwest::Client,
}

impl HttpPhotoUploader {
    pub fn new() -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| UploadError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PhotoUploader for HttpPhotoUploader {
    async fn upload(&self, request: UploadRequest) -> Result<PhotoDto, UploadError> {
        let timestamp = request.timestamp_param();
        let size = request.image.len();
        let part = multipart::Part::bytes(request.image)
            .file_name("photo.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| UploadError::Client(e.to_string()))?;
        let form = multipart::Form::new().part("file", part);

        tracing::debug!("Uploading {} bytes to {}", size, request.url);
        let response = self
            .client
            .post(&request.url)
            .header("X-Device-Token", &request.device_token)
            .query(&[
                ("deviceId", request.device_id.as_str()),
                ("timestamp", timestamp.as_str()),
            ])
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<PhotoDto>()
            .await
            .map_err(|e| UploadError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, hand back its raw head and body, reply with `reply`
    async fn one_shot_server(status_line: &'static str, reply: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/v1/photos/upload", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&raw) {
                    break;
                }
            }
            let response = format!(
                "{}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                reply.len(),
                reply
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (url, handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let head = text[..head_end].to_ascii_lowercase();
        let body_len = raw.len() - (head_end + 4);
        if let Some(line) = head.lines().find(|l| l.starts_with("content-length:")) {
            let expected: usize = line["content-length:".len()..].trim().parse().unwrap_or(0);
            return body_len >= expected;
        }
        text.ends_with("0\r\n\r\n")
    }

    fn request(url: &str) -> UploadRequest {
        UploadRequest {
            url: url.to_string(),
            device_id: "dev-1".into(),
            device_token: "tok".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            image: vec![0xFF, 0xD8, 0xFF, 0xE0],
        }
    }

    #[test]
    fn test_timestamp_is_iso_instant() {
        assert_eq!(request("http://unused").timestamp_param(), "2024-05-01T12:00:00.000Z");
    }

    #[tokio::test]
    async fn test_upload_sends_multipart_with_token() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 200 OK",
            r#"{"photoId":"p1","deviceId":"dev-1","url":"/photos/p1.jpg","timestamp":"2024-05-01T12:00:00Z"}"#,
        )
        .await;

        let uploader = HttpPhotoUploader::new().unwrap();
        let photo = uploader.upload(request(&url)).await.unwrap();
        assert_eq!(photo.url, "/photos/p1.jpg");

        let raw = server.await.unwrap();
        let lower = raw.to_ascii_lowercase();
        assert!(raw.starts_with("POST /api/v1/photos/upload?deviceId=dev-1&timestamp=2024-05-01T12%3A00%3A00.000Z"));
        assert!(lower.contains("x-device-token: tok"));
        assert!(lower.contains("multipart/form-data"));
        assert!(raw.contains(r#"name="file"; filename="photo.jpg""#));
        assert!(lower.contains("content-type: image/jpeg"));
    }

    #[tokio::test]
    async fn test_rejected_upload_reports_status() {
        let (url, server) = one_shot_server("HTTP/1.1 401 Unauthorized", r#"{"error":"bad token"}"#).await;

        let uploader = HttpPhotoUploader::new().unwrap();
        let err = uploader.upload(request(&url)).await.unwrap_err();
        assert!(matches!(err, UploadError::Rejected { status: 401, .. }));
        server.await.unwrap();
    }
}
