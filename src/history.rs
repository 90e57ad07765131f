//! Paginated chat history over REST
//!
//! The history endpoint returns newest-first within a page; the loader
//! reverses each page to chronological order before it is merged. Page 0
//! replaces the current list, higher pages prepend ("load older" on
//! scroll-up). The endpoint has shipped two response shapes over time,
//! a bare array and an object carrying a content list plus a last-page
//! flag, and both must keep working.
//!
//! No positional reconciliation against the live stream happens here:
//! the broker guarantees live items are strictly newer than anything a
//! history page can return.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::models::Message;

/// One fetched page, already in chronological order.
#[derive(Debug)]
pub struct HistoryPage {
    pub page: usize,
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    /// Object shape: `{ "content": [...], "last": bool }`
    Paged { content: Vec<Message>, last: bool },
    /// Bare array shape
    Bare(Vec<Message>),
}

pub struct HistoryLoader {
    client: reqwest::Client,
    base_url: String,
    scope: String,
    credential: String,
    page_size: usize,
}

impl HistoryLoader {
    pub fn new(
        config: &RealtimeConfig,
        base_url: impl Into<String>,
        scope: impl Into<String>,
        credential: impl Into<String>,
    ) -> Result<Self, RealtimeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.history_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            scope: scope.into(),
            credential: credential.into(),
            page_size: config.history_page_size,
        })
    }

    /// Fetch page `n`. A failure surfaces as `RealtimeError::History` and
    /// the caller's existing list stays untouched (merge happens only on
    /// success, in `ChatState`).
    pub async fn load_page(&self, page: usize) -> Result<HistoryPage, RealtimeError> {
        let url = format!("{}/scopes/{}/messages", self.base_url, self.scope);
        debug!(page, scope = %self.scope, "fetching history page");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.credential)
            .query(&[
                ("page", page.to_string()),
                ("size", self.page_size.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<HistoryResponse>()
            .await?;

        let page = into_page(page, self.page_size, response);
        info!(
            page = page.page,
            count = page.messages.len(),
            has_more = page.has_more,
            "history page loaded"
        );
        Ok(page)
    }
}

fn into_page(page: usize, page_size: usize, response: HistoryResponse) -> HistoryPage {
    let (mut messages, has_more) = match response {
        HistoryResponse::Paged { content, last } => (content, !last),
        // A bare array carries no last-page flag; a full page implies more.
        HistoryResponse::Bare(items) => {
            let full = items.len() == page_size;
            (items, full)
        }
    };

    // Server pages are newest-first; state wants chronological.
    messages.reverse();

    HistoryPage {
        page,
        messages,
        has_more,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_message(id: &str, minute: u32) -> String {
        format!(
            r#"{{"id": "{}", "content": "x", "author": "u1", "createdAt": "2026-03-01T10:{:02}:00Z"}}"#,
            id, minute
        )
    }

    #[test]
    fn test_paged_shape_reversed_to_chronological() {
        // Newest-first on the wire.
        let json = format!(
            r#"{{"content": [{}, {}], "last": false}}"#,
            raw_message("m2", 20),
            raw_message("m1", 10)
        );
        let response: HistoryResponse = serde_json::from_str(&json).unwrap();
        let page = into_page(0, 30, response);

        let ids: Vec<&str> = page.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert!(page.has_more);
    }

    #[test]
    fn test_paged_shape_last_page() {
        let json = format!(r#"{{"content": [{}], "last": true}}"#, raw_message("m1", 10));
        let response: HistoryResponse = serde_json::from_str(&json).unwrap();
        let page = into_page(3, 30, response);
        assert!(!page.has_more);
    }

    #[test]
    fn test_bare_array_shape() {
        let json = format!("[{}, {}]", raw_message("m2", 20), raw_message("m1", 10));
        let response: HistoryResponse = serde_json::from_str(&json).unwrap();

        // Partial page: no more to load.
        let page = into_page(0, 30, response);
        let ids: Vec<&str> = page.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert!(!page.has_more);
    }

    #[test]
    fn test_bare_array_full_page_implies_more() {
        let json = format!("[{}, {}]", raw_message("m2", 20), raw_message("m1", 10));
        let response: HistoryResponse = serde_json::from_str(&json).unwrap();
        let page = into_page(0, 2, response);
        assert!(page.has_more);
    }
}
