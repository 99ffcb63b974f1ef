//!
//! # 下载凭证
//! Short-lived signed tokens that carry a download's parameters so a plain
//! GET can be authorized without cookies or headers.
//!
//! Token layout: `base64url(json claims) "." base64url(hmac-sha256(claims part))`.
//!

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::archive::error::ArchiveError;
use crate::archive::target::DownloadSelector;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TicketError {
    #[error("Invalid ticket")]
    InvalidTicket,

    #[error("Ticket expired")]
    ExpiredTicket,

    #[error("Signing failed: {0}")]
    Signing(String),
}

impl From<TicketError> for ArchiveError {
    fn from(err: TicketError) -> Self {
        match err {
            TicketError::InvalidTicket | TicketError::ExpiredTicket => {
                ArchiveError::Unauthorized(err.to_string())
            }
            TicketError::Signing(message) => ArchiveError::SigningError(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketPayload {
    pub requester: Option<String>,
    pub selector: DownloadSelector,
    /// Unix seconds
    pub issued_at: i64,
}

impl TicketPayload {
    pub fn new(requester: Option<String>, selector: DownloadSelector) -> Self {
        Self {
            requester,
            selector,
            issued_at: Utc::now().timestamp(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "p")]
    payload: TicketPayload,
    #[serde(rename = "e")]
    expires_at: i64,
}

/// A freshly signed token and when it stops working
#[derive(Debug, Clone)]
pub struct IssuedTicket {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct TicketCodec {
    key: Vec<u8>,
    ttl: Duration,
}

impl TicketCodec {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, payload: &TicketPayload) -> Result<IssuedTicket, TicketError> {
        self.issue_at(payload, Utc::now())
    }

    pub fn issue_at(&self, payload: &TicketPayload, now: DateTime<Utc>) -> Result<IssuedTicket, TicketError> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|err| TicketError::Signing(err.to_string()))?;
        let expires_at = now + ttl;

        let claims = Claims {
            payload: payload.clone(),
            expires_at: expires_at.timestamp(),
        };
        let json = serde_json::to_vec(&claims).map_err(|err| TicketError::Signing(err.to_string()))?;
        let body = URL_SAFE_NO_PAD.encode(json);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(body.as_bytes())?);

        Ok(IssuedTicket {
            token: format!("{}.{}", body, signature),
            expires_at,
        })
    }

    pub fn verify(&self, token: &str) -> Result<TicketPayload, TicketError> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<TicketPayload, TicketError> {
        let (body, signature) = token.split_once('.').ok_or(TicketError::InvalidTicket)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TicketError::InvalidTicket)?;

        // 先验签，再解析
        let mut mac = self.mac()?;
        mac.update(body.as_bytes());
        mac.verify_slice(&signature).map_err(|_| TicketError::InvalidTicket)?;

        let json = URL_SAFE_NO_PAD.decode(body).map_err(|_| TicketError::InvalidTicket)?;
        let claims: Claims = serde_json::from_slice(&json).map_err(|_| TicketError::InvalidTicket)?;

        if claims.expires_at <= now.timestamp() {
            return Err(TicketError::ExpiredTicket);
        }

        Ok(claims.payload)
    }

    fn mac(&self) -> Result<HmacSha256, TicketError> {
        HmacSha256::new_from_slice(&self.key).map_err(|err| TicketError::Signing(err.to_string()))
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, TicketError> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
