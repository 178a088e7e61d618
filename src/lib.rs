//! `aks-wi-check` verifies that an Azure Kubernetes Service workload identity
//! is usable from inside a pod.
//!
//! The federated service account token is exchanged for an Entra ID access
//! token, which is then used to list subscriptions and the user-assigned
//! managed identities of the first subscription found. The check succeeds when
//! the managed identity matching `AZURE_CLIENT_ID` is found.
//!
//! ```no_run
//! match aks_wi_check::check(aks_wi_check::connect) {
//!     Ok(outcome) => println!("{:?}", outcome),
//!     Err(e) => eprintln!("{}", e),
//! }
//! ```
//!
//! # Cluster setup
//!
//! The workload identity webhook injects `AZURE_CLIENT_ID`, `AZURE_TENANT_ID`,
//! `AZURE_AUTHORITY_HOST` and `AZURE_FEDERATED_TOKEN_FILE` into pods that carry
//! the label
//!
//! ```yaml
//! metadata:
//!     labels:
//!         azure.workload.identity/use: "true"
//! ```
//!
//! and run as a service account annotated with the managed identity client ID:
//!
//! ```yaml
//! metadata:
//!     annotations:
//!         azure.workload.identity/client-id: <client id>
//! ```
//!
//! # Required role assignments
//!
//! * Reader on a subscription, so that the subscription can be listed
//! * Managed Identity Operator (or Reader) on the same subscription, so that
//!   the managed identity can be looked up
//!
//! Resource groups of the subscription are listed as an extra permission
//! check (Reader or Contributor); a denied listing only produces a warning.

use std::fmt;

pub mod arm;
pub mod config;
pub mod credential;
pub mod probe;
pub mod report;

pub use arm::{ArmClient, ResourceManager};
pub use config::Config;
pub use credential::{TokenCredential, WorkloadIdentityCredential};
pub use probe::{
    is_authorization_failure, probe, Lookup, Outcome, ResourceGroupAccess, Warning,
};
pub use report::Reporter;

pub type Result<T> = std::result::Result<T, CheckError>;

#[cfg(test)]
#[macro_use]
extern crate lazy_static;

#[derive(Debug, Clone, PartialEq)]
pub enum CheckError {
    /// Required workload identity variables are unset or empty
    MissingEnvironment(Vec<&'static str>),
    /// Credential could not be built from the configuration
    InvalidCredential(String),
    /// Federated token file does not look like a JSON Web Token
    MalformedToken,
    /// Token exchange with Entra ID failed
    AuthenticationFailed(String),
    /// Resource Manager responded with a non-success status
    Response {
        status: u16,
        code: Option<String>,
        message: String,
    },
    /// Request could not be sent or its response could not be read
    Transport(String),
    NoSubscriptions,
    /// No user-assigned managed identity has the configured client ID
    NoMatchingIdentity(String),
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CheckError::MissingEnvironment(missing) => write!(
                f,
                "missing one or more required environment variables: {} (not set: {})",
                config::REQUIRED_VARS.join(", "),
                missing.join(", ")
            ),
            CheckError::InvalidCredential(s) => {
                write!(f, "failed to create workload identity credential: {}", s)
            }
            CheckError::MalformedToken => {
                write!(f, "federated token file does not contain a JSON Web Token")
            }
            CheckError::AuthenticationFailed(s) => write!(f, "authentication failed: {}", s),
            CheckError::Response {
                status,
                code: Some(code),
                message,
            } => write!(f, "request failed with status {} ({}): {}", status, code, message),
            CheckError::Response {
                status, message, ..
            } => write!(f, "request failed with status {}: {}", status, message),
            CheckError::Transport(s) => write!(f, "{}", s),
            CheckError::NoSubscriptions => {
                write!(f, "no subscriptions found for the workload identity")
            }
            CheckError::NoMatchingIdentity(client_id) => write!(
                f,
                "no user-assigned managed identity found with client ID {}",
                client_id
            ),
        }
    }
}

impl std::error::Error for CheckError {}

/// Builds the Resource Manager client for `config`.
///
/// No network requests are made: the token is exchanged on the first listing call.
pub fn connect(config: &Config) -> Result<ArmClient<WorkloadIdentityCredential>> {
    log::info!("Initializing workload identity credential");
    let credential = WorkloadIdentityCredential::new(config)?;
    ArmClient::new(credential)
}

/// Reads the configuration from the environment and probes Resource Manager
/// through the client returned by `connect`.
///
/// `connect` is not called when the configuration is incomplete.
pub fn check<A, F>(connect: F) -> Result<Outcome>
where
    A: ResourceManager,
    F: FnOnce(&Config) -> Result<A>,
{
    let config = Config::from_env()?;
    let arm = connect(&config)?;
    probe(&config, &arm)
}
