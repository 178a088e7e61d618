use std::{env, path::PathBuf};

use crate::{CheckError, Result};

pub const CLIENT_ID_VAR: &str = "AZURE_CLIENT_ID";
pub const TENANT_ID_VAR: &str = "AZURE_TENANT_ID";
pub const FEDERATED_TOKEN_FILE_VAR: &str = "AZURE_FEDERATED_TOKEN_FILE";
pub const AUTHORITY_HOST_VAR: &str = "AZURE_AUTHORITY_HOST";

/// Required variables, in the order they are reported.
pub const REQUIRED_VARS: [&str; 3] = [CLIENT_ID_VAR, TENANT_ID_VAR, FEDERATED_TOKEN_FILE_VAR];

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com/";

/// Workload identity settings injected into the pod by the workload identity webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Client ID of the user-assigned managed identity the service account is federated with
    pub client_id: String,
    pub tenant_id: String,
    /// Projected service account token, exchanged for an Entra ID access token
    pub federated_token_file: PathBuf,
    pub authority_host: String,
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// Unset and empty variables are treated the same way: every missing required
    /// variable is listed in the returned [`CheckError::MissingEnvironment`].
    pub fn from_env() -> Result<Config> {
        let client_id = non_empty_var(CLIENT_ID_VAR);
        let tenant_id = non_empty_var(TENANT_ID_VAR);
        let token_file = non_empty_var(FEDERATED_TOKEN_FILE_VAR);
        let authority_host =
            non_empty_var(AUTHORITY_HOST_VAR).unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.into());

        log::debug!("{}: {}", CLIENT_ID_VAR, client_id.as_deref().unwrap_or(""));
        log::debug!("{}: {}", TENANT_ID_VAR, tenant_id.as_deref().unwrap_or(""));
        log::debug!("{}: {}", AUTHORITY_HOST_VAR, authority_host);
        log::debug!("{}: {}", FEDERATED_TOKEN_FILE_VAR, token_file.as_deref().unwrap_or(""));

        match (client_id, tenant_id, token_file) {
            (Some(client_id), Some(tenant_id), Some(token_file)) => Ok(Config {
                client_id,
                tenant_id,
                federated_token_file: token_file.into(),
                authority_host,
            }),
            (client_id, tenant_id, token_file) => {
                let missing = [client_id.is_none(), tenant_id.is_none(), token_file.is_none()]
                    .into_iter()
                    .zip(REQUIRED_VARS)
                    .filter_map(|(missing, name)| missing.then_some(name))
                    .collect();
                Err(CheckError::MissingEnvironment(missing))
            }
        }
    }
}
