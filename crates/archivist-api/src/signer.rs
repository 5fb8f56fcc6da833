use std::time::Duration;

use archivist_common::{
    error::{ArchivistError, Result},
    time,
};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct LinkSignerConfig {
    /// Externally reachable base of this service, without trailing slash.
    pub public_url: String,
    pub ttl: Duration,
    pub secret: Vec<u8>,
}

impl Default for LinkSignerConfig {
    fn default() -> Self {
        let mut secret = Vec::with_capacity(32);
        secret.extend_from_slice(Uuid::new_v4().as_bytes());
        secret.extend_from_slice(Uuid::new_v4().as_bytes());
        Self {
            public_url: "http://127.0.0.1:8080".to_string(),
            ttl: Duration::from_secs(15 * 60),
            secret,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedLink {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Time-bounded download links for stored archives:
/// `{public_url}/objects/{key}?expires={unix}&signature={hex hmac}`.
#[derive(Clone)]
pub struct LinkSigner {
    config: LinkSignerConfig,
}

impl LinkSigner {
    pub fn new(config: LinkSignerConfig) -> Self {
        Self { config }
    }

    pub fn sign(&self, key: &str) -> Result<SignedLink> {
        self.sign_at(key, time::now())
    }

    pub fn sign_at(&self, key: &str, now: DateTime<Utc>) -> Result<SignedLink> {
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .map_err(|err| ArchivistError::InvalidArgument(format!("invalid link ttl: {err}")))?;
        let expires_at = now + ttl;
        let expires = expires_at.timestamp();
        let signature = hex::encode(self.mac(key, expires)?.finalize().into_bytes());
        Ok(SignedLink {
            url: format!(
                "{}/objects/{key}?expires={expires}&signature={signature}",
                self.config.public_url.trim_end_matches('/')
            ),
            expires_at,
        })
    }

    pub fn verify(&self, key: &str, expires: i64, signature: &str) -> Result<()> {
        self.verify_at(key, expires, signature, time::now())
    }

    pub fn verify_at(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let decoded = hex::decode(signature)
            .map_err(|_| ArchivistError::AccessDenied("malformed link signature".to_string()))?;
        self.mac(key, expires)?
            .verify_slice(&decoded)
            .map_err(|_| ArchivistError::AccessDenied("link signature does not match".to_string()))?;

        let expires_at = Utc
            .timestamp_opt(expires, 0)
            .single()
            .ok_or_else(|| ArchivistError::AccessDenied("invalid link expiry".to_string()))?;
        if expires_at <= now {
            return Err(ArchivistError::AccessDenied("link has expired".to_string()));
        }
        Ok(())
    }

    fn mac(&self, key: &str, expires: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|err| ArchivistError::Crypto(format!("invalid signing secret: {err}")))?;
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }
}
