//! Google Drive file store over the v3 REST API
//!
//! Authenticates with a bearer token taken from `[drive] access_token` or
//! `CRM_ELT_DRIVE_TOKEN`. Token refresh is left to whoever issues the token.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use super::{FileStore, RemoteFile, SourceError};
use crate::config::DriveSection;

const PAGE_SIZE: &str = "1000";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

/// Drive-backed file store
pub struct DriveStore {
    client: Client,
    api_base: String,
    token: String,
}

impl DriveStore {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .build()
            .map_err(|e| SourceError::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn from_config(drive: &DriveSection) -> Result<Self, SourceError> {
        let token = drive.access_token.clone().ok_or_else(|| {
            SourceError::InvalidStage("Drive access token not configured".to_string())
        })?;
        Self::new(drive.api_base.clone(), token)
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base)
    }

    fn upload_url(&self, id: &str) -> String {
        format!("{}/upload/drive/v3/files/{}", self.api_base, id)
    }

    async fn check(response: Response, what: &str) -> Result<Response, SourceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(what.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        Err(SourceError::Http(format!("{} failed ({}): {}", what, status, body)))
    }
}

/// Drive search query for the non-trashed children of a folder
pub(crate) fn list_query(folder: &str) -> String {
    format!("'{}' in parents and trashed = false", folder.replace('\'', "\\'"))
}

fn http_err(e: reqwest::Error) -> SourceError {
    SourceError::Http(e.to_string())
}

#[async_trait(?Send)]
impl FileStore for DriveStore {
    fn kind(&self) -> &'static str {
        "drive"
    }

    async fn list_files(&self, folder: &str) -> Result<Vec<RemoteFile>, SourceError> {
        let query = list_query(folder);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("q", query.as_str()),
                ("fields", "nextPageToken, files(id, name)"),
                ("pageSize", PAGE_SIZE),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }

            let response = self
                .client
                .get(self.files_url())
                .bearer_auth(&self.token)
                .query(&params)
                .send()
                .await
                .map_err(http_err)?;
            let page: FileList = Self::check(response, &format!("list folder {}", folder))
                .await?
                .json()
                .await
                .map_err(http_err)?;

            debug!("Drive page: {} file(s)", page.files.len());
            files.extend(page.files);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(files)
    }

    async fn download(&self, id: &str, local_path: &Path) -> Result<(), SourceError> {
        let response = self
            .client
            .get(format!("{}/{}", self.files_url(), id))
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(http_err)?;
        let bytes = Self::check(response, &format!("download {}", id))
            .await?
            .bytes()
            .await
            .map_err(http_err)?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &bytes).await?;
        Ok(())
    }

    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        mime_type: &str,
        parent_folder: &str,
        existing_id: Option<&str>,
    ) -> Result<String, SourceError> {
        let id = match existing_id {
            Some(id) => id.to_string(),
            None => {
                let metadata = serde_json::json!({
                    "name": name,
                    "parents": [parent_folder],
                    "mimeType": mime_type,
                });
                let response = self
                    .client
                    .post(self.files_url())
                    .bearer_auth(&self.token)
                    .json(&metadata)
                    .send()
                    .await
                    .map_err(http_err)?;
                let created: CreatedFile = Self::check(response, &format!("create {}", name))
                    .await?
                    .json()
                    .await
                    .map_err(http_err)?;
                created.id
            }
        };

        let content = tokio::fs::read(local_path).await?;
        let response = self
            .client
            .patch(self.upload_url(&id))
            .bearer_auth(&self.token)
            .query(&[("uploadType", "media")])
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(content)
            .send()
            .await
            .map_err(http_err)?;
        Self::check(response, &format!("upload {}", name)).await?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// A request as seen by the local Drive stand-in
    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        target: String,
        authorized: bool,
        body: Vec<u8>,
    }

    type Log = Arc<Mutex<Vec<Seen>>>;

    async fn read_request(stream: &mut TcpStream) -> Option<Seen> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.lines();
        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?.to_string();
        let length = head
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        Some(Seen {
            method,
            target,
            authorized: head.to_ascii_lowercase().contains("authorization: bearer t"),
            body: buf[header_end..].to_vec(),
        })
    }

    fn route(request: &Seen) -> (u16, String) {
        let path = request.target.split('?').next().unwrap_or_default();
        match (request.method.as_str(), path) {
            ("GET", "/drive/v3/files") if request.target.contains("pageToken=p2") => (
                200,
                r#"{"files":[{"id":"f2","name":"buyers_2026.xlsx"}]}"#.to_string(),
            ),
            ("GET", "/drive/v3/files") => (
                200,
                r#"{"files":[{"id":"f1","name":"leads_2026.xlsx"}],"nextPageToken":"p2"}"#
                    .to_string(),
            ),
            ("GET", "/drive/v3/files/f1") => (200, "EventID\n1\n".to_string()),
            ("POST", "/drive/v3/files") => (200, r#"{"id":"created"}"#.to_string()),
            ("PATCH", p) if p.starts_with("/upload/drive/v3/files/") => (200, "{}".to_string()),
            _ => (404, r#"{"error":"not found"}"#.to_string()),
        }
    }

    async fn respond(mut stream: TcpStream, log: Log) {
        let Some(request) = read_request(&mut stream).await else {
            return;
        };
        let (status, body) = route(&request);
        log.lock().unwrap().push(request);
        let reason = if status == 200 { "OK" } else { "Not Found" };
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason,
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }

    /// Start a local Drive stand-in; returns its base URL and request log
    async fn drive_server() -> (String, Log) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let accepted = log.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(respond(stream, accepted.clone()));
            }
        });
        (format!("http://{}", addr), log)
    }

    #[tokio::test]
    async fn test_list_follows_page_tokens() {
        let (base, log) = drive_server().await;
        let store = DriveStore::new(base, "t").unwrap();

        let files = store.list_files("folder-1").await.unwrap();

        let ids: Vec<&str> = files.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "f2"]);
        let seen = log.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| r.method == "GET" && r.authorized));
        assert!(seen[0].target.contains("pageSize=1000"));
        assert!(!seen[0].target.contains("pageToken"));
        assert!(seen[1].target.contains("pageToken=p2"));
    }

    #[tokio::test]
    async fn test_download_writes_file_and_maps_missing() {
        let (base, log) = drive_server().await;
        let store = DriveStore::new(base, "t").unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let local = dir.path().join("work").join("leads_2026.csv");

        store.download("f1", &local).await.unwrap();
        assert_eq!(std::fs::read_to_string(&local).unwrap(), "EventID\n1\n");
        assert!(log.lock().unwrap()[0].target.contains("alt=media"));

        let missing = store.download("gone", &dir.path().join("gone.csv")).await;
        assert!(matches!(missing, Err(SourceError::NotFound(_))));
        assert!(!dir.path().join("gone.csv").exists());
    }

    #[tokio::test]
    async fn test_upload_creates_then_overwrites_by_id() {
        let (base, log) = drive_server().await;
        let store = DriveStore::new(base, "t").unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let local = dir.path().join("report.csv");
        std::fs::write(&local, "a,b\n1,2\n").unwrap();

        let id = store
            .upload(&local, "report.csv", "text/csv", "folder-1", None)
            .await
            .unwrap();
        assert_eq!(id, "created");
        {
            let seen = log.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[0].method, "POST");
            let metadata: serde_json::Value = serde_json::from_slice(&seen[0].body).unwrap();
            assert_eq!(metadata["name"], "report.csv");
            assert_eq!(metadata["parents"][0], "folder-1");
            assert_eq!(seen[1].method, "PATCH");
            assert!(seen[1].target.starts_with("/upload/drive/v3/files/created?"));
            assert!(seen[1].target.contains("uploadType=media"));
            assert_eq!(seen[1].body, b"a,b\n1,2\n");
        }

        let id = store
            .upload(&local, "report.csv", "text/csv", "folder-1", Some("existing"))
            .await
            .unwrap();
        assert_eq!(id, "existing");
        let seen = log.lock().unwrap();
        // Overwrite skips the metadata create
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].method, "PATCH");
        assert!(seen[2].target.starts_with("/upload/drive/v3/files/existing?"));
    }

    #[test]
    fn test_list_query_escapes_quotes() {
        assert_eq!(list_query("abc"), "'abc' in parents and trashed = false");
        assert_eq!(list_query("a'b"), "'a\\'b' in parents and trashed = false");
    }

    #[test]
    fn test_from_config_requires_token() {
        let drive = DriveSection::default();
        assert!(matches!(
            DriveStore::from_config(&drive),
            Err(SourceError::InvalidStage(_))
        ));

        let drive = DriveSection {
            access_token: Some("t".to_string()),
            api_base: "https://example.test/".to_string(),
        };
        let store = DriveStore::from_config(&drive).unwrap();
        assert_eq!(store.files_url(), "https://example.test/drive/v3/files");
        assert_eq!(
            store.upload_url("x"),
            "https://example.test/upload/drive/v3/files/x"
        );
    }
}
