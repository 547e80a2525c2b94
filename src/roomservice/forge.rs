//! Repository listing from the forge (GitHub-compatible REST API).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// HTTP GET, behind a trait so tests can answer without the network.
pub trait HttpClient {
    fn get(&self, url: &str) -> Result<Vec<u8>>;
}

/// Blocking reqwest client.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
    token: Option<String>,
}

impl ReqwestClient {
    /// `token` is sent as `Authorization: token <token>` when present.
    pub fn new(token: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("roomservice/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("creating HTTP client")?;
        Ok(Self {
            client,
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str) -> Result<Vec<u8>> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("token {token}"));
        }
        let response = request
            .send()
            .with_context(|| format!("requesting '{url}'"))?;
        if !response.status().is_success() {
            bail!("HTTP {} from {}", response.status(), url);
        }
        let body = response
            .bytes()
            .with_context(|| format!("reading response from '{url}'"))?;
        Ok(body.to_vec())
    }
}

/// The part of a forge repository record we use.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForgeRepository {
    pub name: String,
}

/// Every repository of `owner`, fetched page by page until an empty page.
pub fn list_repositories(
    http: &dyn HttpClient,
    api_url: &str,
    owner: &str,
) -> Result<Vec<ForgeRepository>> {
    let base = api_url.trim_end_matches('/');
    let mut repositories = Vec::new();
    for page in 1.. {
        let url = format!("{base}/users/{owner}/repos?page={page}");
        let body = http.get(&url)?;
        let batch: Vec<ForgeRepository> = serde_json::from_slice(&body)
            .with_context(|| format!("parsing repository list from '{url}'"))?;
        debug!(page, count = batch.len(), "fetched repository page");
        if batch.is_empty() {
            break;
        }
        repositories.extend(batch);
    }
    Ok(repositories)
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Answers from a URL map; unknown URLs return an empty JSON list.
    #[derive(Default)]
    pub(crate) struct MockHttpClient {
        pub(crate) responses: HashMap<String, Vec<u8>>,
        pub(crate) requested: RefCell<Vec<String>>,
    }

    impl MockHttpClient {
        pub(crate) fn with_pages(base: &str, owner: &str, pages: &[&str]) -> Self {
            let responses = pages
                .iter()
                .enumerate()
                .map(|(i, body)| {
                    (
                        format!("{base}/users/{owner}/repos?page={}", i + 1),
                        body.as_bytes().to_vec(),
                    )
                })
                .collect();
            Self {
                responses,
                requested: RefCell::default(),
            }
        }
    }

    impl HttpClient for MockHttpClient {
        fn get(&self, url: &str) -> Result<Vec<u8>> {
            self.requested.borrow_mut().push(url.to_string());
            Ok(self
                .responses
                .get(url)
                .cloned()
                .unwrap_or_else(|| b"[]".to_vec()))
        }
    }
}
