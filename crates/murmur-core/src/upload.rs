//! Blossom media upload.
//!
//! Voice messages carry a URL, not audio. Before a draft is published its
//! recording is uploaded to one of the author's Blossom servers (their kind
//! 10063 list, or the configured fallback) and the returned blob URL becomes
//! the draft content.

use std::time::Duration;

use nostr_blossom::client::BlossomClient;
use nostr_sdk::prelude::{Filter, Kind, NostrSigner, PublicKey};
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::{FeedConfig, DEFAULT_BLOSSOM_SERVER};
use crate::error::{FeedError, Result};
use crate::message::{kind, Message};
use crate::store::MessageStore;

/// Repair a common typo in published server lists (`blossom/net/` for
/// `blossom.net/`).
pub fn fix_url(url: &str) -> String {
    url.replacen("/net/", ".net/", 1)
}

/// Valid http(s) server URLs from `server` tags, in order, without duplicates.
pub fn server_urls(lists: &[Message]) -> Vec<Url> {
    let mut servers: Vec<Url> = Vec::new();
    for list in lists {
        for raw in list.tag_values("server") {
            let Ok(url) = Url::parse(&fix_url(raw)) else {
                tracing::debug!(url = raw, "skipping invalid blossom server");
                continue;
            };
            if matches!(url.scheme(), "http" | "https") && !servers.contains(&url) {
                servers.push(url);
            }
        }
    }
    servers
}

/// Configured fallback servers, or the built-in default.
pub fn fallback_servers(config: &FeedConfig) -> Vec<Url> {
    let configured: Vec<Url> = config
        .blossom_servers
        .iter()
        .filter_map(|s| Url::parse(&fix_url(s)).ok())
        .collect();
    if !configured.is_empty() {
        return configured;
    }
    Url::parse(DEFAULT_BLOSSOM_SERVER).into_iter().collect()
}

/// Upload servers for `author`: their published list when it has usable
/// entries, the fallback otherwise. Never fails; lookup errors fall back.
pub async fn discover_servers<S: MessageStore>(
    store: &S,
    author: Option<&str>,
    config: &FeedConfig,
    timeout: Duration,
) -> Vec<Url> {
    let Some(author) = author.and_then(|a| PublicKey::parse(a).ok()) else {
        return fallback_servers(config);
    };
    let filter = Filter::new()
        .kind(Kind::from_u16(kind::BLOSSOM_SERVER_LIST))
        .author(author)
        .limit(10);

    match store.query(vec![filter], timeout).await {
        Ok(mut lists) => {
            lists.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let servers = server_urls(&lists);
            if servers.is_empty() {
                tracing::debug!("no usable blossom servers published, using fallback");
                return fallback_servers(config);
            }
            servers
        }
        Err(e) => {
            tracing::warn!(error = %e, "blossom server lookup failed, using fallback");
            fallback_servers(config)
        }
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Uploads blobs to a list of Blossom servers, trying each in order.
pub struct BlossomUploader<T> {
    servers: Vec<Url>,
    signer: T,
}

impl<T: NostrSigner> BlossomUploader<T> {
    pub fn new(servers: Vec<Url>, signer: T) -> Self {
        Self { servers, signer }
    }

    pub fn servers(&self) -> &[Url] {
        &self.servers
    }

    /// Upload `data` and return its blob URL. A server answering with a hash
    /// other than the payload's is treated as a failure.
    pub async fn upload(&self, data: Vec<u8>, content_type: Option<&str>) -> Result<String> {
        if self.servers.is_empty() {
            return Err(FeedError::Upload("no blossom servers available".into()));
        }
        let expected = sha256_hex(&data);

        for server in &self.servers {
            let client = BlossomClient::new(server.clone());
            let descriptor = match client
                .upload_blob(data.clone(), content_type.map(str::to_string), None, Some(&self.signer))
                .await
            {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "blossom upload failed");
                    continue;
                }
            };

            let returned = descriptor.sha256.to_string();
            if returned != expected {
                tracing::warn!(server = %server, %expected, %returned, "blossom server returned a different hash");
                continue;
            }
            tracing::info!(server = %server, bytes = data.len(), "blob uploaded");
            return Ok(descriptor.url.to_string());
        }

        Err(FeedError::Upload(format!("all {} blossom servers failed", self.servers.len())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nostr_sdk::prelude::Keys;

    use super::*;
    use crate::testing::{signed_kind, MemoryRelay};

    fn server_list(keys: &Keys, at: u64, urls: &[&str]) -> Message {
        let tags = urls.iter().map(|u| vec!["server".to_string(), u.to_string()]).collect();
        signed_kind(keys, kind::BLOSSOM_SERVER_LIST, at, "", tags)
    }

    #[test]
    fn fixes_net_typo() {
        assert_eq!(fix_url("https://blossom/net/"), "https://blossom.net/");
        assert_eq!(fix_url("https://blossom.band"), "https://blossom.band");
    }

    #[test]
    fn keeps_valid_http_servers_once() {
        let keys = Keys::generate();
        let list = server_list(
            &keys,
            10,
            &["https://cdn.example/net/", "not a url", "ftp://files.example", "https://cdn.example.net/"],
        );
        let servers = server_urls(&[list]);
        assert_eq!(servers, vec![Url::parse("https://cdn.example.net/").unwrap()]);
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn discovery_prefers_the_published_list() {
        let relay = MemoryRelay::new();
        let keys = Keys::generate();
        relay.insert(server_list(&keys, 10, &["https://old.example"]));
        relay.insert(server_list(&keys, 20, &["https://new.example"]));

        let author = keys.public_key().to_hex();
        let config = FeedConfig::default();
        let servers = discover_servers(&relay, Some(&author), &config, Duration::from_secs(1)).await;
        assert_eq!(
            servers,
            vec![Url::parse("https://new.example").unwrap(), Url::parse("https://old.example").unwrap()]
        );
    }

    #[tokio::test]
    async fn discovery_falls_back() {
        let relay: Arc<MemoryRelay> = MemoryRelay::new();
        let config = FeedConfig { blossom_servers: Vec::new(), ..FeedConfig::default() };
        let default = vec![Url::parse(DEFAULT_BLOSSOM_SERVER).unwrap()];

        // Logged out
        assert_eq!(discover_servers(&relay, None, &config, Duration::from_secs(1)).await, default);

        // Nothing published
        let author = Keys::generate().public_key().to_hex();
        assert_eq!(discover_servers(&relay, Some(&author), &config, Duration::from_secs(1)).await, default);

        // Store unreachable
        relay.set_offline(true);
        assert_eq!(discover_servers(&relay, Some(&author), &config, Duration::from_secs(1)).await, default);
    }

    #[tokio::test]
    async fn uploading_without_servers_fails() {
        let uploader = BlossomUploader::new(Vec::new(), Keys::generate());
        assert!(matches!(
            uploader.upload(b"audio".to_vec(), Some("audio/webm")).await,
            Err(FeedError::Upload(_))
        ));
    }
}
