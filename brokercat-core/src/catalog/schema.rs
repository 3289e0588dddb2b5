//! Catalog payload parsing and validation
//!
//! A catalog is accepted whole or not at all: one bad record rejects the
//! entire payload, so an injected record can never ride along with valid ones.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

use super::record::{BrokerRecord, Platform};

const HTTPS_PREFIX: &str = "https://";

/// Schema validation errors; each one rejects the whole catalog
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Not JSON, wrong top-level shape, or a field of the wrong type
    #[error("Malformed catalog: {0}")]
    Malformed(String),

    /// A required field is absent or blank
    #[error("Record {index}: missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },

    /// Platform is neither MT4 nor MT5
    #[error("Record {index}: invalid platform '{value}'")]
    InvalidPlatform { index: usize, value: String },

    /// Web terminal URL does not use https
    #[error("Record {index}: web terminal URL must start with https:// (got '{url}')")]
    InsecureUrl { index: usize, url: String },

    /// Web terminal URL starts with https:// but is not a usable URL
    #[error("Record {index}: invalid web terminal URL '{url}'")]
    InvalidUrl { index: usize, url: String },

    /// Logo is present but is not an absolute http(s) URL with a host
    #[error("Record {index}: invalid logo URL '{url}'")]
    InvalidLogoUrl { index: usize, url: String },

    /// Two records share a server name
    #[error("Duplicate server '{server}' in records {first_index} and {index}")]
    DuplicateServer {
        server: String,
        first_index: usize,
        index: usize,
    },
}

/// Wire form of a record before validation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    name: Option<String>,
    server: Option<String>,
    platform: Option<String>,
    web_terminal_url: Option<String>,
    logo: Option<String>,
    description: Option<String>,
    demo: Option<bool>,
}

/// Parse and validate a raw catalog payload
///
/// Accepts either a top-level array of records or an object with a
/// `brokers` array. Unknown fields are ignored at every level.
pub fn parse(raw_json: &[u8]) -> Result<Vec<BrokerRecord>, SchemaError> {
    let value: Value = serde_json::from_slice(raw_json)
        .map_err(|e| SchemaError::Malformed(format!("invalid JSON: {e}")))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("brokers") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(SchemaError::Malformed(
                    "'brokers' must be an array".to_string(),
                ))
            }
            None => {
                return Err(SchemaError::Malformed(
                    "object payload has no 'brokers' array".to_string(),
                ))
            }
        },
        _ => {
            return Err(SchemaError::Malformed(
                "payload must be an array or an object with a 'brokers' array".to_string(),
            ))
        }
    };

    let mut records = Vec::with_capacity(items.len());
    let mut seen_servers: HashMap<String, usize> = HashMap::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let raw: RawRecord = serde_json::from_value(item)
            .map_err(|e| SchemaError::Malformed(format!("record {index}: {e}")))?;
        let record = validate_record(index, raw)?;

        if let Some(&first_index) = seen_servers.get(&record.server) {
            return Err(SchemaError::DuplicateServer {
                server: record.server,
                first_index,
                index,
            });
        }
        seen_servers.insert(record.server.clone(), index);
        records.push(record);
    }

    Ok(records)
}

fn validate_record(index: usize, raw: RawRecord) -> Result<BrokerRecord, SchemaError> {
    let name = required(index, "name", raw.name)?;
    let server = required(index, "server", raw.server)?;

    let platform_value = required(index, "platform", raw.platform)?;
    let platform: Platform = platform_value
        .parse()
        .map_err(|_| SchemaError::InvalidPlatform {
            index,
            value: platform_value.clone(),
        })?;

    let web_terminal_url = required(index, "webTerminalUrl", raw.web_terminal_url)?;
    validate_https_url(index, &web_terminal_url)?;

    let logo = optional(raw.logo);
    if let Some(logo) = &logo {
        validate_logo_url(index, logo)?;
    }

    Ok(BrokerRecord {
        name,
        server,
        platform,
        web_terminal_url,
        logo,
        description: optional(raw.description),
        demo: raw.demo.unwrap_or(false),
    })
}

fn required(index: usize, field: &'static str, value: Option<String>) -> Result<String, SchemaError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(SchemaError::MissingField { index, field })
}

fn optional(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn validate_https_url(index: usize, url: &str) -> Result<(), SchemaError> {
    if !url.starts_with(HTTPS_PREFIX) {
        return Err(SchemaError::InsecureUrl {
            index,
            url: url.to_string(),
        });
    }

    // The URL parser collapses extra slashes ("https:///x" has host "x"),
    // so an empty authority is rejected before parsing
    let authority_missing = url[HTTPS_PREFIX.len()..].starts_with(['/', '\\']);
    let valid = !authority_missing
        && Url::parse(url).is_ok_and(|parsed| parsed.scheme() == "https" && parsed.host().is_some());

    if !valid {
        return Err(SchemaError::InvalidUrl {
            index,
            url: url.to_string(),
        });
    }

    Ok(())
}

fn validate_logo_url(index: usize, url: &str) -> Result<(), SchemaError> {
    let valid = Url::parse(url).is_ok_and(|parsed| {
        matches!(parsed.scheme(), "https" | "http") && parsed.host().is_some()
    });

    if !valid {
        return Err(SchemaError::InvalidLogoUrl {
            index,
            url: url.to_string(),
        });
    }

    Ok(())
}
