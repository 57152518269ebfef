//! Guarded resolution of media referenced by requests.
//!
//! Inline payloads are decoded locally. Remote URLs are fetched only after the
//! target host has been checked against loopback, private and link-local
//! ranges, both literally and after DNS resolution, and the body is streamed
//! under a hard byte ceiling.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{Stream, StreamExt};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Url, redirect};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::{ConfigError, MediaError};

const INLINE_TARGET: &str = "inline data";
const GENERIC_BINARY_TYPE: &str = "application/octet-stream";

/// Media referenced by a request: either inline base64 data with a declared
/// media type, or an absolute `http(s)` URL (`data:` URLs count as inline).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MediaReference {
    Inline { media_type: String, data: String },
    Url(String),
}

impl MediaReference {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url(url.into())
    }

    pub fn inline(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::Inline {
            media_type: media_type.into(),
            data: STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Any,
}

impl MediaKind {
    fn family_prefix(self) -> Option<&'static str> {
        match self {
            Self::Image => Some("image/"),
            Self::Audio => Some("audio/"),
            Self::Video => Some("video/"),
            Self::Any => None,
        }
    }

    fn expected(self) -> String {
        match self.family_prefix() {
            Some(prefix) => format!("{prefix}*"),
            None => "*/*".to_string(),
        }
    }

    fn accepts(self, media_type: &str) -> bool {
        self.family_prefix()
            .is_none_or(|prefix| media_type.starts_with(prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

impl ResolvedMedia {
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, STANDARD.encode(&self.bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPolicy {
    pub max_bytes: u64,
    pub timeout_ms: u64,
    pub max_redirects: u32,
    /// Skips every address check. Only for trusted deployments and tests.
    pub allow_private_networks: bool,
}

impl MediaPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bytes == 0 {
            return Err(ConfigError::InvalidMediaPolicy {
                reason: "max_bytes must be >= 1".to_string(),
            });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout {
                timeout_ms: self.timeout_ms,
            });
        }
        Ok(())
    }
}

impl Default for MediaPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
            timeout_ms: 30_000,
            max_redirects: 3,
            allow_private_networks: false,
        }
    }
}

/// Hostname lookup used by the DNS rebinding check.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolves through the operating system via `tokio::net::lookup_host`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

#[derive(Clone)]
pub struct MediaResolver {
    client: reqwest::Client,
    policy: MediaPolicy,
    host_resolver: Arc<dyn HostResolver>,
}

impl fmt::Debug for MediaResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaResolver")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl MediaResolver {
    pub fn new(policy: MediaPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;

        let client = base_client_builder().build().map_err(|error| {
            ConfigError::InvalidMediaPolicy {
                reason: format!("failed to build http client: {error}"),
            }
        })?;

        Ok(Self {
            client,
            policy,
            host_resolver: Arc::new(SystemResolver),
        })
    }

    pub fn with_host_resolver(mut self, host_resolver: Arc<dyn HostResolver>) -> Self {
        self.host_resolver = host_resolver;
        self
    }

    pub fn policy(&self) -> &MediaPolicy {
        &self.policy
    }

    pub async fn resolve(
        &self,
        reference: &MediaReference,
        kind: MediaKind,
        cancel: &CancellationToken,
    ) -> Result<ResolvedMedia, MediaError> {
        match reference {
            MediaReference::Inline { media_type, data } => {
                self.decode_inline(media_type.trim(), data)
            }
            MediaReference::Url(raw) => {
                if let Some(rest) = raw.strip_prefix("data:") {
                    return self.decode_data_url(rest);
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(MediaError::Canceled {
                        target: raw.clone(),
                    }),
                    result = self.fetch_remote(raw, kind) => result,
                }
            }
        }
    }

    /// Runs the address checks for `url` without fetching it.
    pub async fn check_target(&self, url: &Url) -> Result<(), MediaError> {
        self.vet_target(url).await.map(|_| ())
    }

    /// Address checks for one hop. Returns the vetted addresses when `url`
    /// names a host that had to be looked up; the fetch must connect to
    /// exactly those.
    async fn vet_target(&self, url: &Url) -> Result<Option<Vec<IpAddr>>, MediaError> {
        let target = url.as_str();

        if !matches!(url.scheme(), "http" | "https") {
            return Err(MediaError::InvalidReference {
                reason: format!("unsupported scheme {:?} in {target}", url.scheme()),
            });
        }

        let host = url
            .host_str()
            .ok_or_else(|| MediaError::InvalidReference {
                reason: format!("missing host in {target}"),
            })?;

        if self.policy.allow_private_networks {
            return Ok(None);
        }

        if is_loopback_hostname(host) {
            return Err(unsafe_target(target, format!("host {host} is a loopback name")));
        }

        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            if is_blocked_ip(ip) {
                return Err(unsafe_target(target, format!("address {ip} is not public")));
            }
            return Ok(None);
        }

        let port = url.port_or_known_default().unwrap_or(80);
        let lookup = tokio::time::timeout(
            Duration::from_millis(self.policy.timeout_ms),
            self.host_resolver.lookup(host, port),
        )
        .await
        .map_err(|_| MediaError::Transport {
            target: target.to_string(),
            status_code: None,
            message: format!(
                "resolving {host} timed out after {}ms",
                self.policy.timeout_ms
            ),
        })?;
        let addrs = lookup.map_err(|error| MediaError::Transport {
            target: target.to_string(),
            status_code: None,
            message: format!("failed to resolve {host}: {error}"),
        })?;

        if addrs.is_empty() {
            return Err(MediaError::Transport {
                target: target.to_string(),
                status_code: None,
                message: format!("{host} resolved to no addresses"),
            });
        }

        if let Some(ip) = addrs.iter().copied().find(|ip| is_blocked_ip(*ip)) {
            return Err(unsafe_target(
                target,
                format!("host {host} resolves to non-public address {ip}"),
            ));
        }

        Ok(Some(addrs))
    }

    /// Client for one hop. A looked-up host is pinned to its vetted addresses
    /// so the connection cannot re-resolve to somewhere else.
    fn client_for(
        &self,
        url: &Url,
        vetted: Option<&[IpAddr]>,
    ) -> Result<reqwest::Client, MediaError> {
        let (Some(addrs), Some(host)) = (vetted, url.host_str()) else {
            return Ok(self.client.clone());
        };

        // The port is ignored by reqwest; the one in the url is used.
        let pinned = addrs
            .iter()
            .map(|ip| SocketAddr::new(*ip, 0))
            .collect::<Vec<_>>();

        base_client_builder()
            .resolve_to_addrs(host, &pinned)
            .build()
            .map_err(|error| MediaError::Transport {
                target: url.to_string(),
                status_code: None,
                message: format!("failed to build pinned http client: {error}"),
            })
    }

    fn decode_inline(&self, media_type: &str, data: &str) -> Result<ResolvedMedia, MediaError> {
        if media_type.is_empty() {
            return Err(MediaError::InvalidReference {
                reason: "inline media requires a media type".to_string(),
            });
        }

        // base64 inflates by 4/3; reject before decoding anything huge.
        let estimated = (data.len() as u64 / 4).saturating_mul(3);
        if estimated > self.policy.max_bytes.saturating_add(3) {
            return Err(self.too_large(INLINE_TARGET));
        }

        let bytes = STANDARD
            .decode(data.trim().as_bytes())
            .map_err(|error| MediaError::InvalidReference {
                reason: format!("inline data is not valid base64: {error}"),
            })?;

        if bytes.len() as u64 > self.policy.max_bytes {
            return Err(self.too_large(INLINE_TARGET));
        }

        Ok(ResolvedMedia {
            bytes,
            media_type: media_type.to_ascii_lowercase(),
        })
    }

    fn decode_data_url(&self, rest: &str) -> Result<ResolvedMedia, MediaError> {
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| MediaError::InvalidReference {
                reason: "data url is missing ','".to_string(),
            })?;

        let Some(media_type) = header.strip_suffix(";base64") else {
            return Err(MediaError::InvalidReference {
                reason: "only base64 data urls are supported".to_string(),
            });
        };

        self.decode_inline(media_type.trim(), payload)
    }

    async fn fetch_remote(&self, raw: &str, kind: MediaKind) -> Result<ResolvedMedia, MediaError> {
        let mut url = Url::parse(raw).map_err(|error| MediaError::InvalidReference {
            reason: format!("invalid url {raw:?}: {error}"),
        })?;

        let mut redirects = 0;
        loop {
            let vetted = self.vet_target(&url).await.inspect_err(|error| {
                warn!(target_url = %url, %error, "media target rejected");
            })?;

            let response = self
                .client_for(&url, vetted.as_deref())?
                .get(url.clone())
                .timeout(Duration::from_millis(self.policy.timeout_ms))
                .send()
                .await
                .map_err(|error| MediaError::Transport {
                    target: url.to_string(),
                    status_code: None,
                    message: error.to_string(),
                })?;

            let status = response.status();
            if status.is_redirection() {
                if redirects >= self.policy.max_redirects {
                    return Err(MediaError::Transport {
                        target: url.to_string(),
                        status_code: Some(status.as_u16()),
                        message: format!(
                            "too many redirects (max {})",
                            self.policy.max_redirects
                        ),
                    });
                }

                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| MediaError::Transport {
                        target: url.to_string(),
                        status_code: Some(status.as_u16()),
                        message: "redirect without location header".to_string(),
                    })?;

                let next = url.join(location).map_err(|error| MediaError::Transport {
                    target: url.to_string(),
                    status_code: Some(status.as_u16()),
                    message: format!("invalid redirect location {location:?}: {error}"),
                })?;

                debug!(from = %url, to = %next, "following media redirect");
                url = next;
                redirects += 1;
                continue;
            }

            if !status.is_success() {
                return Err(MediaError::Transport {
                    target: url.to_string(),
                    status_code: Some(status.as_u16()),
                    message: format!("http status {}", status.as_u16()),
                });
            }

            let media_type = content_type_for(&url, response.headers(), kind)?;

            if let Some(length) = response.content_length() {
                if length > self.policy.max_bytes {
                    return Err(self.too_large(url.as_str()));
                }
            }

            let bytes =
                read_capped(response.bytes_stream(), self.policy.max_bytes, url.as_str()).await?;

            debug!(target_url = %url, bytes = bytes.len(), %media_type, "media fetched");
            return Ok(ResolvedMedia { bytes, media_type });
        }
    }

    fn too_large(&self, target: &str) -> MediaError {
        MediaError::PayloadTooLarge {
            target: target.to_string(),
            limit_bytes: self.policy.max_bytes,
        }
    }
}

/// Redirects are followed by hand so every hop passes the guard, and proxies
/// are bypassed so the connection goes to the checked address.
fn base_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .redirect(redirect::Policy::none())
        .no_proxy()
}

/// Collects a byte stream, failing as soon as more than `limit` bytes arrive.
/// The chunk that crosses the limit is dropped and nothing further is read.
pub async fn read_capped<S, B, E>(
    stream: S,
    limit: u64,
    target: &str,
) -> Result<Vec<u8>, MediaError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut buffer = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| MediaError::Transport {
            target: target.to_string(),
            status_code: None,
            message: error.to_string(),
        })?;
        let chunk = chunk.as_ref();

        if buffer.len() as u64 + chunk.len() as u64 > limit {
            return Err(MediaError::PayloadTooLarge {
                target: target.to_string(),
                limit_bytes: limit,
            });
        }
        buffer.extend_from_slice(chunk);
    }

    Ok(buffer)
}

/// True for addresses a fetch must never reach: loopback, private,
/// link-local, unspecified, broadcast and shared ranges of either family.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || octets[0] == 0
        // 100.64.0.0/10 shared address space
        || (octets[0] == 100 && (octets[1] & 0xc0) == 0x40)
}

fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(mapped);
    }

    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

fn is_loopback_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    matches!(
        host.as_str(),
        "localhost" | "localhost.localdomain" | "ip6-localhost" | "ip6-loopback"
    ) || host.ends_with(".localhost")
}

fn unsafe_target(target: &str, reason: String) -> MediaError {
    MediaError::UnsafeTarget {
        target: target.to_string(),
        reason,
    }
}

fn content_type_for(
    url: &Url,
    headers: &reqwest::header::HeaderMap,
    kind: MediaKind,
) -> Result<String, MediaError> {
    let declared = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
        .filter(|value| !value.is_empty());

    // Absent or generic headers fall back to the URL's extension.
    let media_type = match declared {
        Some(value) if value != GENERIC_BINARY_TYPE => Some(value),
        declared => mime_guess::from_path(url.path())
            .first()
            .map(|mime| mime.essence_str().to_string())
            .or(declared),
    };

    match media_type {
        Some(value) if kind.accepts(&value) => Ok(value),
        other => Err(MediaError::UnexpectedContentType {
            target: url.to_string(),
            expected: kind.expected(),
            actual: other,
        }),
    }
}

#[cfg(test)]
mod tests;
