use std::{
    cell::RefCell,
    fs,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use regex::Regex;
use reqwest::Url;
use serde::Deserialize;

use crate::{config::Config, CheckError, Result};

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

// Tokens closer than this to expiry are exchanged again
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Bearer token for Azure Resource Manager requests.
#[derive(Clone, PartialEq)]
pub struct AccessToken {
    pub secret: String,
    pub expires_at: SystemTime,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        match self.expires_at.duration_since(SystemTime::now()) {
            Ok(remaining) => remaining > REFRESH_MARGIN,
            Err(_) => false,
        }
    }
}

pub trait TokenCredential {
    fn get_token(&self, scope: &str) -> Result<AccessToken>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// Exchanges the projected service account token for an Entra ID access token.
pub struct WorkloadIdentityCredential {
    client_id: String,
    token_file: PathBuf,
    token_url: Url,
    http: reqwest::blocking::Client,
    cached: RefCell<Option<(String, AccessToken)>>,
}

fn validate_assertion(assertion: &str) -> Result<&str> {
    // very shallow validation: the webhook projects a JWT, anything else is a broken mount
    match assertion.split('.').count() {
        3 => Ok(assertion),
        _ => Err(CheckError::MalformedToken),
    }
}

fn token_endpoint(authority_host: &str, tenant_id: &str) -> Result<Url> {
    let tenant_re = Regex::new(r"^[0-9A-Za-z.-]+$").map_err(|e| {
        CheckError::InvalidCredential(format!("tenant ID pattern failed to compile: {}", e))
    })?;
    if !tenant_re.is_match(tenant_id) {
        return Err(CheckError::InvalidCredential(format!(
            "invalid tenant ID {:?}: only alphanumeric characters, '.' and '-' are allowed",
            tenant_id
        )));
    }

    let mut authority = Url::parse(authority_host).map_err(|e| {
        CheckError::InvalidCredential(format!("invalid authority host {:?}: {}", authority_host, e))
    })?;
    if authority.scheme() != "https" {
        return Err(CheckError::InvalidCredential(format!(
            "authority host {:?} must use https",
            authority_host
        )));
    }
    if !authority.path().ends_with('/') {
        let path = format!("{}/", authority.path());
        authority.set_path(&path);
    }
    authority
        .join(&format!("{}/oauth2/v2.0/token", tenant_id))
        .map_err(|e| CheckError::InvalidCredential(format!("invalid token endpoint: {}", e)))
}

impl WorkloadIdentityCredential {
    /// Builds the credential without touching the network or the token file.
    pub fn new(config: &Config) -> Result<Self> {
        let token_url = token_endpoint(&config.authority_host, &config.tenant_id)?;
        Ok(Self::with_token_url(config, token_url))
    }

    fn with_token_url(config: &Config, token_url: Url) -> Self {
        Self {
            client_id: config.client_id.clone(),
            token_file: config.federated_token_file.clone(),
            token_url,
            http: reqwest::blocking::Client::new(),
            cached: RefCell::new(None),
        }
    }

    fn read_assertion(&self) -> Result<String> {
        // the webhook rotates the file, so it is read again for every exchange
        let content = fs::read_to_string(&self.token_file).map_err(|e| {
            CheckError::AuthenticationFailed(format!(
                "failed to read federated token file {}: {}",
                self.token_file.display(),
                e
            ))
        })?;
        validate_assertion(content.trim()).map(String::from)
    }

    fn exchange(&self, scope: &str) -> Result<AccessToken> {
        let assertion = self.read_assertion()?;
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_assertion", assertion.as_str()),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("grant_type", "client_credentials"),
            ("scope", scope),
        ];

        log::debug!("Requesting token from {}", self.token_url);
        let response = match self.http.post(self.token_url.clone()).form(&params).send() {
            Ok(response) => response,
            Err(e) => {
                return Err(CheckError::AuthenticationFailed(format!(
                    "token request failed: {}",
                    e
                )))
            }
        };

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<TokenErrorResponse>() {
                Ok(TokenErrorResponse {
                    error_description: Some(description),
                    ..
                }) => description,
                Ok(TokenErrorResponse {
                    error: Some(error), ..
                }) => error,
                _ => "no error description".into(),
            };
            return Err(CheckError::AuthenticationFailed(format!(
                "token endpoint returned {}: {}",
                status, detail
            )));
        }

        match response.json::<TokenResponse>() {
            Ok(token) => {
                let now = SystemTime::now();
                Ok(AccessToken {
                    secret: token.access_token,
                    // an unrepresentable expiry is treated as already expired
                    expires_at: now
                        .checked_add(Duration::from_secs(token.expires_in))
                        .unwrap_or(now),
                })
            }
            Err(e) => Err(CheckError::AuthenticationFailed(format!(
                "failed to parse token response: {}",
                e
            ))),
        }
    }
}

impl TokenCredential for WorkloadIdentityCredential {
    fn get_token(&self, scope: &str) -> Result<AccessToken> {
        if let Some((cached_scope, token)) = self.cached.borrow().as_ref() {
            if cached_scope == scope && token.is_fresh() {
                return Ok(token.clone());
            }
        }

        let token = self.exchange(scope)?;
        log::info!("Acquired access token for scope {}", scope);
        *self.cached.borrow_mut() = Some((scope.to_string(), token.clone()));
        Ok(token)
    }
}
