use std::{fmt, time::Duration};

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HTTP method a signed URL is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedMethod {
    /// Object download.
    Get,
    /// Object upload.
    Put,
}

impl SignedMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
        }
    }
}

/// Query parameters carried by a signed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedParams {
    /// Expiry as a unix timestamp in seconds.
    pub expires: i64,
    /// Upload size ceiling, only present on upload URLs.
    pub max_size: Option<u64>,
    /// Hex-encoded HMAC-SHA256 signature.
    pub signature: String,
}

impl SignedParams {
    /// Renders the parameters as a query string (without the leading `?`).
    pub fn to_query(&self) -> String {
        match self.max_size {
            Some(max_size) => format!(
                "expires={}&max_size={}&signature={}",
                self.expires, max_size, self.signature
            ),
            None => format!("expires={}&signature={}", self.expires, self.signature),
        }
    }
}

/// Issues and verifies expiring HMAC signatures over object keys.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlSigner").field("secret", &"<redacted>").finish()
    }
}

impl UrlSigner {
    /// Creates a signer from a shared secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Creates a signer with a random per-process secret.
    pub fn random() -> Self {
        let secret = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        Self::new(secret)
    }

    /// Signs `key` for `method`, valid for `ttl` from `now` (unix seconds).
    pub fn sign(
        &self,
        method: SignedMethod,
        key: &str,
        ttl: Duration,
        max_size: Option<u64>,
        now: i64,
    ) -> SignedParams {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = now.saturating_add(ttl);
        let mac = self.mac(method, key, expires, max_size);
        SignedParams {
            expires,
            max_size,
            signature: hex::encode(mac.finalize().into_bytes()),
        }
    }

    /// Returns `true` when `params` carry a valid, unexpired signature.
    pub fn verify(&self, method: SignedMethod, key: &str, params: &SignedParams, now: i64) -> bool {
        if now > params.expires {
            return false;
        }

        let Ok(signature) = hex::decode(&params.signature) else {
            return false;
        };

        self.mac(method, key, params.expires, params.max_size)
            .verify_slice(&signature)
            .is_ok()
    }

    fn mac(&self, method: SignedMethod, key: &str, expires: i64, max_size: Option<u64>) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(method.as_str().as_bytes());
        mac.update(b"\n");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac.update(b"\n");
        if let Some(max_size) = max_size {
            mac.update(max_size.to_string().as_bytes());
        }
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips_and_expires() {
        let signer = UrlSigner::new("secret");
        let params = signer.sign(SignedMethod::Get, "a/b.txt", Duration::from_secs(60), None, 1_000);

        assert_eq!(params.expires, 1_060);
        assert!(signer.verify(SignedMethod::Get, "a/b.txt", &params, 1_030));
        assert!(!signer.verify(SignedMethod::Get, "a/b.txt", &params, 1_061));
        assert!(!signer.verify(SignedMethod::Put, "a/b.txt", &params, 1_030));
        assert!(!signer.verify(SignedMethod::Get, "a/c.txt", &params, 1_030));
    }

    #[test]
    fn max_size_is_bound_into_the_signature() {
        let signer = UrlSigner::new("secret");
        let mut params =
            signer.sign(SignedMethod::Put, "up.bin", Duration::from_secs(60), Some(10), 0);
        assert!(signer.verify(SignedMethod::Put, "up.bin", &params, 0));

        params.max_size = Some(10_000);
        assert!(!signer.verify(SignedMethod::Put, "up.bin", &params, 0));
        assert!(params.to_query().contains("max_size=10000"));
    }
}
