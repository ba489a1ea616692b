//! Resolves a release channel to a concrete K3s version.
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use tracing::debug;

use crate::api::DEFAULT_CHANNEL;
use crate::error::{Error, Result};

/// Default release channel server.
pub const DEFAULT_CHANNEL_SERVER: &str = "https://update.k3s.io/v1-release";

/// Maps a channel name to an immutable version string usable as an image tag.
#[async_trait::async_trait]
pub trait VersionResolver: Send + Sync {
    /// Resolves `channel`; the empty channel means "stable".
    async fn resolve(&self, channel: &str) -> Result<String>;
}

/// [`VersionResolver`] that asks the release channel server, which answers
/// `GET <base>/channels/<channel>` with a redirect to the release page.
///
/// Exactly one request per call; redirects are never followed.
#[derive(Clone, Debug)]
pub struct ChannelResolver {
    client: reqwest::Client,
    base: String,
}

impl ChannelResolver {
    pub fn new(base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()?;
        Ok(ChannelResolver {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn channel_url(&self, channel: &str) -> String {
        let channel = if channel.is_empty() {
            DEFAULT_CHANNEL
        } else {
            channel
        };
        format!("{}/channels/{}", self.base, channel)
    }
}

#[async_trait::async_trait]
impl VersionResolver for ChannelResolver {
    async fn resolve(&self, channel: &str) -> Result<String> {
        let url = self.channel_url(channel);
        let response = self.client.get(&url).send().await?;
        let status = response.status().as_u16();
        let version = response
            .headers()
            .get(LOCATION)
            .and_then(|location| location.to_str().ok())
            .and_then(version_from_location)
            .ok_or_else(|| Error::MissingRedirect {
                channel: channel.to_string(),
                status,
            })?;
        debug!(%url, %version, "Resolved release channel");
        Ok(version)
    }
}

/// Last path segment of a redirect target, with `+` turned into `-` since
/// image tags cannot carry build metadata.
pub fn version_from_location(location: &str) -> Option<String> {
    let path = location
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');
    let segment = path.rsplit('/').next().unwrap_or_default();
    if segment.is_empty() || segment.contains(':') {
        return None;
    }
    Some(segment.replace('+', "-"))
}
