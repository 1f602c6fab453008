use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::SystemTime;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Uri};

use crate::error::Error;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text.split('?').next().unwrap_or(uri_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn join_endpoint_path(endpoint: &str, resource_path: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    let relative = resource_path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

/// Encodes a parameter multimap as a query string; a parameter with no values
/// is emitted as a bare name (`?uploads`).
pub(crate) fn encode_parameters(parameters: &BTreeMap<String, Vec<String>>) -> String {
    let mut encoded = String::new();
    for (name, values) in parameters {
        let encoded_name = encode_component(name);
        if values.is_empty() {
            if !encoded.is_empty() {
                encoded.push('&');
            }
            encoded.push_str(&encoded_name);
            continue;
        }
        for value in values {
            if !encoded.is_empty() {
                encoded.push('&');
            }
            encoded.push_str(&encoded_name);
            encoded.push('=');
            encoded.push_str(&encode_component(value));
        }
    }
    encoded
}

fn encode_component(text: &str) -> String {
    url::form_urlencoded::byte_serialize(text.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Percent-encodes each segment of a resource path, keeping the separators.
pub(crate) fn encode_path(resource_path: &str) -> String {
    resource_path
        .split('/')
        .map(encode_component)
        .collect::<Vec<_>>()
        .join("/")
}

/// `encoded_path` must already be percent-encoded.
pub(crate) fn build_uri(
    endpoint: &Uri,
    encoded_path: &str,
    parameters: &BTreeMap<String, Vec<String>>,
) -> Result<Uri, Error> {
    let endpoint_text = endpoint.to_string();
    let mut uri_text = join_endpoint_path(&endpoint_text, encoded_path);
    if encoded_path.is_empty() && !uri_text.ends_with('/') {
        uri_text.push('/');
    }
    let query = encode_parameters(parameters);
    if !query.is_empty() {
        uri_text.push('?');
        uri_text.push_str(&query);
    }
    uri_text
        .parse()
        .map_err(|_| Error::InvalidUri { uri: uri_text })
}

pub(crate) fn endpoint_of(uri: &Uri) -> Result<Uri, Error> {
    let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) else {
        return Err(Error::InvalidUri {
            uri: uri.to_string(),
        });
    };
    format!("{scheme}://{authority}")
        .parse()
        .map_err(|_| Error::InvalidUri {
            uri: uri.to_string(),
        })
}

pub(crate) fn resolve_redirect_uri(current: &Uri, location: &str) -> Option<Uri> {
    let current = url::Url::parse(&current.to_string()).ok()?;
    let next = current.join(location).ok()?;
    match next.scheme() {
        "http" | "https" => next.as_str().parse().ok(),
        _ => None,
    }
}

pub(crate) fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_http_date(headers: &HeaderMap) -> Option<SystemTime> {
    let raw_value = header_text(headers, http::header::DATE.as_str())?;
    httpdate::parse_http_date(raw_value).ok()
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}

pub(crate) fn epoch_seconds(time: SystemTime) -> f64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(before) => -before.duration().as_secs_f64(),
    }
}
