//! Google Cloud credentials: a plain API key, or a service account key that
//! we exchange for short-lived OAuth2 access tokens.

use std::{
    env,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use base64::{
    Engine as _,
    prelude::{BASE64_STANDARD, BASE64_URL_SAFE_NO_PAD},
};
use reqwest::RequestBuilder;
use ring::{
    rand::SystemRandom,
    signature::{RSA_PKCS1_SHA256, RsaKeyPair},
};
use tokio::sync::RwLock;

use crate::prelude::*;

/// Environment variable holding an API key, if no credentials file is given.
pub const API_KEY_VAR: &str = "GOOGLE_VISION_API_KEY";

/// Standard environment variable pointing at a service account key.
pub const APPLICATION_CREDENTIALS_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Scope requested for service account tokens.
const TOKEN_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// How long we ask for a token to last.
const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Refresh tokens this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// How we authenticate to the recognition service.
#[derive(Debug)]
pub enum Credentials {
    /// Sent as the `key` query parameter.
    ApiKey(String),
    /// Sent as a bearer token.
    ServiceAccount(ServiceAccount),
}

impl Credentials {
    /// Load credentials from `path`, or failing that from
    /// [`API_KEY_VAR`] or [`APPLICATION_CREDENTIALS_VAR`].
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_file(path).await;
        }
        if let Ok(key) = env::var(API_KEY_VAR) {
            return Self::parse(&key).with_context(|| format!("Invalid {}", API_KEY_VAR));
        }
        if let Some(path) = env::var_os(APPLICATION_CREDENTIALS_VAR) {
            return Self::load_file(Path::new(&path)).await;
        }
        bail!(
            "No credentials file given, and neither {} nor {} is set",
            API_KEY_VAR,
            APPLICATION_CREDENTIALS_VAR
        )
    }

    async fn load_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read credentials file {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Invalid credentials file {:?}", path))
    }

    /// Parse a service account JSON key, or else treat `contents` as an API
    /// key.
    pub fn parse(contents: &str) -> Result<Self> {
        let contents = contents.trim();
        if contents.starts_with('{') {
            let key = serde_json::from_str::<ServiceAccountKey>(contents)
                .context("Failed to parse credentials JSON")?;
            return Ok(Credentials::ServiceAccount(ServiceAccount::new(key)?));
        }
        if contents.is_empty() {
            bail!("API key is empty");
        }
        Ok(Credentials::ApiKey(contents.to_owned()))
    }

    /// Add our credentials to `request`, fetching a token with `client` if
    /// needed.
    pub async fn authorize(
        &self,
        client: &reqwest::Client,
        request: RequestBuilder,
    ) -> Result<RequestBuilder> {
        match self {
            Credentials::ApiKey(key) => Ok(request.query(&[("key", key)])),
            Credentials::ServiceAccount(account) => {
                Ok(request.bearer_auth(account.access_token(client).await?))
            }
        }
    }
}

/// The fields we need from a service account JSON key.
#[derive(Deserialize)]
struct ServiceAccountKey {
    #[serde(rename = "type")]
    key_type: String,
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_owned()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now() + REFRESH_MARGIN
    }
}

/// A service account, with its current access token.
pub struct ServiceAccount {
    client_email: String,
    token_uri: String,
    key_pair: RsaKeyPair,
    token: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccount {
    fn new(key: ServiceAccountKey) -> Result<Self> {
        if key.key_type != "service_account" {
            bail!("Unsupported credentials type {:?}", key.key_type);
        }
        let der = decode_pem(&key.private_key.replace("\\n", "\n"))?;
        let key_pair = RsaKeyPair::from_pkcs8(&der)
            .map_err(|err| anyhow!("Invalid service account private key: {}", err))?;
        Ok(Self {
            client_email: key.client_email,
            token_uri: key.token_uri,
            key_pair,
            token: RwLock::new(None),
        })
    }

    /// A current access token, fetching a new one if ours is about to
    /// expire.
    pub async fn access_token(&self, client: &reqwest::Client) -> Result<String> {
        if let Some(cached) = self.token.read().await.as_ref()
            && cached.is_fresh()
        {
            return Ok(cached.access_token.clone());
        }

        let mut token = self.token.write().await;
        // Another task may have refreshed it while we waited.
        if let Some(cached) = token.as_ref()
            && cached.is_fresh()
        {
            return Ok(cached.access_token.clone());
        }
        let fresh = self.fetch_token(client).await?;
        let access_token = fresh.access_token.clone();
        *token = Some(fresh);
        Ok(access_token)
    }

    #[instrument(level = "debug", skip_all, fields(client_email = %self.client_email))]
    async fn fetch_token(&self, client: &reqwest::Client) -> Result<CachedToken> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("System clock is before 1970")?
            .as_secs();
        let assertion = self.assertion(now)?;
        let response = client
            .post(&self.token_uri)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("Token request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Token request failed (status {}): {}", status, body.trim());
        }
        let token = response
            .json::<TokenResponse>()
            .await
            .context("Failed to parse token response")?;
        debug!("Fetched access token");
        let lifetime = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(TOKEN_LIFETIME);
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }

    /// A signed RS256 JWT asking for a token, issued at `now` (Unix seconds).
    fn assertion(&self, now: u64) -> Result<String> {
        let header = BASE64_URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let claims = serde_json::json!({
            "iss": self.client_email,
            "scope": TOKEN_SCOPE,
            "aud": self.token_uri,
            "iat": now,
            "exp": now + TOKEN_LIFETIME.as_secs(),
        });
        let payload = BASE64_URL_SAFE_NO_PAD.encode(claims.to_string());
        let signing_input = format!("{}.{}", header, payload);

        let mut signature = vec![0; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(
                &RSA_PKCS1_SHA256,
                &SystemRandom::new(),
                signing_input.as_bytes(),
                &mut signature,
            )
            .map_err(|err| anyhow!("Failed to sign token request: {}", err))?;
        Ok(format!(
            "{}.{}",
            signing_input,
            BASE64_URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}

/// The DER contents of the first PEM block in `pem`.
fn decode_pem(pem: &str) -> Result<Vec<u8>> {
    let body = pem
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.starts_with("-----BEGIN "))
        .skip(1)
        .take_while(|line| !line.starts_with("-----END "))
        .collect::<String>();
    if body.is_empty() {
        bail!("Private key is not in PEM format");
    }
    BASE64_STANDARD
        .decode(body)
        .context("Private key PEM is not valid base64")
}
