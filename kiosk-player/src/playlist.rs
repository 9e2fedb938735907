use std::sync::Mutex;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One row of the `/playlist` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub local_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_time: Option<String>,
}

impl PlaylistItem {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn from_local_name(local_name: impl Into<String>) -> Self {
        Self {
            local_name: Some(local_name.into()),
            ..Self::default()
        }
    }

    /// Where to load this item from: its `url`, else the media endpoint path
    /// for its `localName`.
    pub fn address(&self) -> Option<String> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Some(url.to_string());
        }
        self.local_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(|name| format!("/media?name={}", urlencoding::encode(name)))
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistDocument {
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("playlist request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid playlist url: {0}")]
    Url(#[from] url::ParseError),
    #[error("superseded by a newer playlist request")]
    Superseded,
    #[error("playlist fetcher was aborted")]
    Aborted,
}

#[derive(Default)]
struct InFlight {
    generation: u64,
    token: Option<CancellationToken>,
}

/// Fetches `/playlist`. Starting a fetch cancels the one still in flight.
pub struct PlaylistFetcher {
    http: reqwest::Client,
    base: Url,
    endpoint: Url,
    in_flight: Mutex<InFlight>,
    aborted: CancellationToken,
}

impl PlaylistFetcher {
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self, FetchError> {
        let base = Url::parse(base_url)?;
        let endpoint = base.join("/playlist")?;
        Ok(Self {
            http,
            base,
            endpoint,
            in_flight: Mutex::new(InFlight::default()),
            aborted: CancellationToken::new(),
        })
    }

    /// Items come back with absolute `url`s resolved against the base URL.
    pub async fn fetch(&self) -> Result<Vec<PlaylistItem>, FetchError> {
        let token = self.aborted.child_token();
        let generation = {
            let mut slot = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(previous) = slot.token.replace(token.clone()) {
                previous.cancel();
            }
            slot.generation += 1;
            slot.generation
        };

        let request = async {
            let response = self
                .http
                .get(self.endpoint.clone())
                .send()
                .await?
                .error_for_status()?;
            let document: PlaylistDocument = response.json().await?;
            Ok::<_, FetchError>(document.items)
        };
        let result = tokio::select! {
            _ = token.cancelled() => Err(if self.aborted.is_cancelled() {
                FetchError::Aborted
            } else {
                FetchError::Superseded
            }),
            result = request => result,
        };

        {
            let mut slot = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.generation == generation {
                slot.token = None;
            }
        }

        let items = result?;
        tracing::debug!(items = items.len(), "playlist fetched");
        Ok(items.into_iter().map(|item| self.resolve(item)).collect())
    }

    /// Cancels the in-flight fetch and refuses later ones.
    pub fn abort(&self) {
        self.aborted.cancel();
    }

    fn resolve(&self, mut item: PlaylistItem) -> PlaylistItem {
        if let Some(address) = item.address()
            && let Ok(absolute) = self.base.join(&address)
        {
            item.url = Some(absolute.to_string());
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_prefers_url_then_local_name() {
        let both = PlaylistItem {
            url: Some("http://cdn/x.mp4".into()),
            local_name: Some("a b.mp4".into()),
            ..PlaylistItem::default()
        };
        assert_eq!(both.address().as_deref(), Some("http://cdn/x.mp4"));
        assert_eq!(
            PlaylistItem::from_local_name("a b.mp4").address().as_deref(),
            Some("/media?name=a%20b.mp4")
        );
        assert_eq!(PlaylistItem::from_url("  ").address(), None);
        assert_eq!(PlaylistItem::default().address(), None);
    }

    #[test]
    fn parses_server_rows() {
        let doc: PlaylistDocument = serde_json::from_str(
            r#"{"items":[{"title":"Intro","localName":"a_intro.mp4","url":"/media?name=a_intro.mp4","size":5,"modifiedTime":null}]}"#,
        )
        .unwrap();
        assert_eq!(doc.items.len(), 1);
        assert_eq!(doc.items[0].local_name.as_deref(), Some("a_intro.mp4"));
        assert_eq!(doc.items[0].size, Some(5));

        let empty: PlaylistDocument = serde_json::from_str("{}").unwrap();
        assert!(empty.items.is_empty());
    }

    #[test]
    fn resolves_relative_addresses_against_base() {
        let fetcher = PlaylistFetcher::new("http://kiosk.local:8080/").unwrap();
        let item = fetcher.resolve(PlaylistItem::from_local_name("a_intro.mp4"));
        assert_eq!(
            item.url.as_deref(),
            Some("http://kiosk.local:8080/media?name=a_intro.mp4")
        );
        let absolute = fetcher.resolve(PlaylistItem::from_url("https://cdn.example/v.mp4"));
        assert_eq!(absolute.url.as_deref(), Some("https://cdn.example/v.mp4"));
    }
}
