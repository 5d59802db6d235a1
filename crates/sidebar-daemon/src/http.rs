//! `SidebarBackend` over the sidebar HTTP API.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use sidebar_core::backend::{BackendError, Result, SidebarBackend};
use sidebar_core::wire::{WireError, decode_bootstrap, decode_session_page};
use sidebar_core::{Bootstrap, DirectoryEntry, DirectorySessionPage, IndexEntry, Page, UiPrefs};
use url::Url;

pub const BOOTSTRAP_PATH: &str = "chat-sidebar/bootstrap";
pub const EVENTS_PATH: &str = "chat-sidebar/events";
pub const RECENT_INDEX_PATH: &str = "chat-sidebar/recent-index";
pub const RUNNING_INDEX_PATH: &str = "chat-sidebar/running-index";
pub const DIRECTORIES_PATH: &str = "directories";
pub const PREFERENCES_PATH: &str = "ui/chat-sidebar/preferences";
pub const PREFERENCES_EVENTS_PATH: &str = "ui/chat-sidebar/preferences/events";

pub struct HttpBackend {
    client: Client,
    base: Url,
    page_size: usize,
}

impl HttpBackend {
    /// `base_url` is the API root, e.g. `http://127.0.0.1:3000/api`.
    pub fn new(base_url: &str, page_size: usize) -> std::result::Result<Self, url::ParseError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            base,
            page_size,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| BackendError::Network(format!("invalid url for {path}: {e}")))
    }

    fn paged(&self, path: &str, offset: usize, limit: usize) -> Result<Url> {
        let mut url = self.endpoint(path)?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(body)),
            StatusCode::CONFLICT => Err(BackendError::Conflict {
                current: current_from_error_body(&body).map(Box::new),
            }),
            StatusCode::PRECONDITION_REQUIRED => Err(BackendError::PreconditionRequired),
            _ => Err(BackendError::Status {
                status: status.as_u16(),
                message: body,
            }),
        }
    }

    async fn get_json(&self, url: Url) -> Result<Value> {
        tracing::debug!(%url, "GET");
        let response = self.send(self.client.request(Method::GET, url)).await?;
        read_json(response).await
    }
}

async fn read_json(response: Response) -> Result<Value> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| BackendError::Network(e.to_string()))?;
    let value = serde_json::from_slice(&bytes).map_err(WireError::from)?;
    Ok(value)
}

/// `{error, code, current}` bodies of 409 and 428 responses.
fn current_from_error_body(body: &str) -> Option<UiPrefs> {
    let value: Value = serde_json::from_str(body).ok()?;
    let current = value.get("current")?.clone();
    serde_json::from_value::<UiPrefs>(current).ok().map(UiPrefs::sanitized)
}

/// Decode a `{items, total, offset, limit, hasMore, nextOffset}` page,
/// dropping items `decode` rejects.
pub fn decode_page<T>(
    value: &Value,
    offset: usize,
    limit: usize,
    decode: impl Fn(&Value) -> Option<T>,
) -> Result<Page<T>> {
    if !value.is_object() {
        return Err(WireError::NotAnObject("page").into());
    }
    let count = |key: &str| value.get(key).and_then(Value::as_u64).map(|n| n as usize);
    let items: Vec<T> = value
        .get("items")
        .and_then(Value::as_array)
        .map(|raw| raw.iter().filter_map(&decode).collect())
        .unwrap_or_default();
    let offset = count("offset").unwrap_or(offset);
    let total = count("total").unwrap_or(offset + items.len());
    let next_offset = count("nextOffset");
    let has_more = value
        .get("hasMore")
        .and_then(Value::as_bool)
        .unwrap_or(next_offset.is_some());
    Ok(Page {
        total,
        offset,
        limit: count("limit").unwrap_or(limit),
        has_more,
        next_offset,
        items,
    })
}

#[async_trait]
impl SidebarBackend for HttpBackend {
    async fn bootstrap(&self) -> Result<Bootstrap> {
        let mut url = self.endpoint(BOOTSTRAP_PATH)?;
        url.query_pairs_mut()
            .append_pair("limit", &self.page_size.to_string());
        let value = self.get_json(url).await?;
        Ok(decode_bootstrap(&value, self.page_size)?)
    }

    async fn directories(&self, offset: usize, limit: usize) -> Result<Page<DirectoryEntry>> {
        let value = self
            .get_json(self.paged(DIRECTORIES_PATH, offset, limit)?)
            .await?;
        decode_page(&value, offset, limit, DirectoryEntry::from_value)
    }

    async fn directory_sessions(
        &self,
        directory_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<DirectorySessionPage> {
        let mut url = self.paged(DIRECTORIES_PATH, offset, limit)?;
        url.path_segments_mut()
            .map_err(|_| BackendError::Network(format!("cannot-be-a-base url: {}", self.base)))?
            .pop_if_empty()
            .push(directory_id)
            .push("sessions");
        let value = self.get_json(url).await?;
        let mut page = decode_session_page(&value, limit);
        if page.limit == 0 {
            page.limit = limit;
        }
        Ok(page)
    }

    async fn recent_index(&self, offset: usize, limit: usize) -> Result<Page<IndexEntry>> {
        let value = self
            .get_json(self.paged(RECENT_INDEX_PATH, offset, limit)?)
            .await?;
        decode_page(&value, offset, limit, IndexEntry::from_value)
    }

    async fn running_index(&self, offset: usize, limit: usize) -> Result<Page<IndexEntry>> {
        let value = self
            .get_json(self.paged(RUNNING_INDEX_PATH, offset, limit)?)
            .await?;
        decode_page(&value, offset, limit, IndexEntry::from_value)
    }

    async fn get_preferences(&self) -> Result<UiPrefs> {
        let value = self.get_json(self.endpoint(PREFERENCES_PATH)?).await?;
        let prefs = serde_json::from_value::<UiPrefs>(value).map_err(WireError::from)?;
        Ok(prefs.sanitized())
    }

    async fn put_preferences(&self, expected_version: u64, prefs: &UiPrefs) -> Result<UiPrefs> {
        let url = self.endpoint(PREFERENCES_PATH)?;
        tracing::debug!(%url, expected_version, "PUT preferences");
        let request = self
            .client
            .request(Method::PUT, url)
            .header(reqwest::header::IF_MATCH, expected_version.to_string())
            .json(prefs);
        let response = self.send(request).await?;
        let value = read_json(response).await?;
        let stored = serde_json::from_value::<UiPrefs>(value).map_err(WireError::from)?;
        Ok(stored.sanitized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoints_keep_base_path() {
        let backend = HttpBackend::new("http://127.0.0.1:3000/api", 10).unwrap();
        assert_eq!(
            backend.endpoint(BOOTSTRAP_PATH).unwrap().as_str(),
            "http://127.0.0.1:3000/api/chat-sidebar/bootstrap"
        );
        assert_eq!(
            backend.endpoint("/directories").unwrap().as_str(),
            "http://127.0.0.1:3000/api/directories"
        );
    }

    #[test]
    fn test_paged_query() {
        let backend = HttpBackend::new("http://host/", 10).unwrap();
        let url = backend.paged(RECENT_INDEX_PATH, 40, 20).unwrap();
        assert_eq!(url.as_str(), "http://host/chat-sidebar/recent-index?offset=40&limit=20");
    }

    #[test]
    fn test_decode_page() {
        let value = json!({
            "items": [
                {"sessionId": "s_1", "directoryId": "d1", "directoryPath": "/repo", "updatedAt": 5},
                {"directoryId": "d1"}
            ],
            "total": 7,
            "offset": 0,
            "limit": 2,
            "hasMore": true,
            "nextOffset": 2
        });
        let page = decode_page(&value, 0, 2, IndexEntry::from_value).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.total, 7);
        assert!(page.has_more);
        assert_eq!(page.next_offset, Some(2));

        assert!(decode_page(&json!([1, 2]), 0, 2, IndexEntry::from_value).is_err());
    }

    #[test]
    fn test_conflict_body_carries_current() {
        let body = json!({
            "error": "Sessions sidebar preferences version conflict",
            "code": "version_conflict",
            "current": {"version": 4, "updatedAt": 10, "pinnedSessionIds": ["a", "a"]}
        })
        .to_string();
        let current = current_from_error_body(&body).unwrap();
        assert_eq!(current.version, 4);
        assert_eq!(current.pinned_session_ids, vec!["a"]);
        assert!(current_from_error_body("oops").is_none());
    }
}
