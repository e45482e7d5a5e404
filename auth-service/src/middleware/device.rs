//! Request-derived device identity and client metadata.

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::services::ClientMeta;

#[derive(Serialize)]
struct Fingerprint<'a> {
    user_agent: Option<&'a str>,
    accept_language: Option<&'a str>,
    accept_encoding: Option<&'a str>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Hex SHA-256 over the JSON fingerprint of the client's headers.
///
/// `None` when the request carries none of the fingerprinted headers.
pub fn device_id_from_headers(headers: &HeaderMap) -> Option<String> {
    let fingerprint = Fingerprint {
        user_agent: header_str(headers, header::USER_AGENT),
        accept_language: header_str(headers, header::ACCEPT_LANGUAGE),
        accept_encoding: header_str(headers, header::ACCEPT_ENCODING),
    };
    if fingerprint.user_agent.is_none()
        && fingerprint.accept_language.is_none()
        && fingerprint.accept_encoding.is_none()
    {
        return None;
    }

    let json = serde_json::to_vec(&fingerprint).ok()?;
    Some(hex::encode(Sha256::digest(&json)))
}

/// Stable per-device identifier derived from request headers.
#[derive(Debug, Clone)]
pub struct DeviceFingerprint(pub Option<String>);

impl DeviceFingerprint {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for DeviceFingerprint
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(DeviceFingerprint(device_id_from_headers(&parts.headers)))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ClientMeta
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded_for = header::HeaderName::from_static("x-forwarded-for");
        let forwarded = header_str(&parts.headers, forwarded_for)
            .and_then(|v| v.split(',').next())
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty());
        let ip = forwarded.or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });

        Ok(ClientMeta {
            ip,
            user_agent: header_str(&parts.headers, header::USER_AGENT).map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn no_fingerprint_headers_means_no_device() {
        assert_eq!(device_id_from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn same_headers_give_same_device() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8.0"));
        let a = device_id_from_headers(&headers).unwrap();
        let b = device_id_from_headers(&headers.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        assert_ne!(device_id_from_headers(&headers).unwrap(), a);
    }

    #[test]
    fn fingerprint_is_hash_of_json() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("ua"));
        let expected = hex::encode(Sha256::digest(
            br#"{"user_agent":"ua","accept_language":null,"accept_encoding":null}"#,
        ));
        assert_eq!(device_id_from_headers(&headers), Some(expected));
    }
}
