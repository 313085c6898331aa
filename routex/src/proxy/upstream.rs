//! Outbound request construction per vendor
//!
//! URL and auth-header layout is the only place vendor differences leak out
//! of the transformer pipeline: Anthropic wants `x-api-key` plus a version
//! header, Azure wants `api-key` and a deployment path, Google keys the model
//! into the path and switches endpoint for streaming, everything else is
//! `Authorization: Bearer` against an OpenAI-compatible path.

use http::{HeaderMap, HeaderValue};

use crate::error::{Error, Result};
use crate::models::{Channel, Vendor};

/// Anthropic API version pinned on outbound requests
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Azure OpenAI api-version pinned on outbound requests
const AZURE_API_VERSION: &str = "2024-06-01";

/// Vendor default base URL; Azure and custom channels must configure one
pub fn default_base_url(vendor: Vendor) -> Option<&'static str> {
    match vendor {
        Vendor::Anthropic => Some("https://api.anthropic.com"),
        Vendor::Openai => Some("https://api.openai.com"),
        Vendor::Google => Some("https://generativelanguage.googleapis.com"),
        Vendor::Zhipu => Some("https://open.bigmodel.cn/api/paas/v4"),
        Vendor::Azure | Vendor::Custom => None,
    }
}

/// Effective base URL for a channel, trailing slash trimmed
pub fn base_url(channel: &Channel) -> Result<String> {
    let base = channel
        .base_url
        .as_deref()
        .or_else(|| default_base_url(channel.vendor))
        .ok_or_else(|| {
            Error::Config(format!(
                "channel '{}' ({}) requires a base_url",
                channel.name, channel.vendor
            ))
        })?;
    Ok(base.trim_end_matches('/').to_string())
}

/// Full outbound URL for a chat/completion call
pub fn build_url(channel: &Channel, model: &str, stream: bool) -> Result<String> {
    let base = base_url(channel)?;
    let url = match channel.vendor {
        Vendor::Anthropic => format!("{}/v1/messages", base),
        Vendor::Openai | Vendor::Zhipu | Vendor::Custom => {
            format!("{}/v1/chat/completions", base)
        }
        Vendor::Azure => format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            base, model, AZURE_API_VERSION
        ),
        Vendor::Google => {
            let method = if stream {
                "streamGenerateContent?alt=sse"
            } else {
                "generateContent"
            };
            format!("{}/v1beta/models/{}:{}", base, model, method)
        }
    };
    Ok(url)
}

/// Auth and protocol headers for a channel
pub fn build_headers(channel: &Channel) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let api_key = channel.api_key.as_deref().ok_or_else(|| {
        Error::Config(format!("channel '{}' has no api key", channel.name))
    })?;
    let key_value = HeaderValue::from_str(api_key)
        .map_err(|_| Error::Config(format!("channel '{}' api key is not a valid header", channel.name)))?;

    match channel.vendor {
        Vendor::Anthropic => {
            headers.insert("x-api-key", key_value);
            headers.insert(
                "anthropic-version",
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        Vendor::Azure => {
            headers.insert("api-key", key_value);
        }
        Vendor::Google => {
            headers.insert("x-goog-api-key", key_value);
        }
        Vendor::Openai | Vendor::Zhipu | Vendor::Custom => {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|_| {
                Error::Config(format!(
                    "channel '{}' api key is not a valid header",
                    channel.name
                ))
            })?;
            headers.insert(http::header::AUTHORIZATION, bearer);
        }
    }

    Ok(headers)
}
