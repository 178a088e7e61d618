use crate::{arm::ResourceManager, config::Config, CheckError, Result};

/// Explanation for an authorization failure that stops the probe without failing it.
#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    /// What the identity could not do
    pub problem: String,
    /// Role assignment that would fix it
    pub remedy: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(String),
    /// The listing was rejected with 401 or 403
    Denied(Warning),
}

/// Result of listing the resource groups of the resolved subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceGroupAccess {
    /// Number of resource groups found
    Listed(usize),
    Denied(Warning),
}

impl ResourceGroupAccess {
    fn warning(&self) -> Option<&Warning> {
        match self {
            ResourceGroupAccess::Listed(_) => None,
            ResourceGroupAccess::Denied(warning) => Some(warning),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Verified {
        subscription_id: String,
        resource_groups: ResourceGroupAccess,
        principal_id: String,
    },
    /// Subscription was resolved but the identity listing was denied
    PrincipalDenied {
        subscription_id: String,
        resource_groups: ResourceGroupAccess,
        warning: Warning,
    },
    SubscriptionDenied {
        warning: Warning,
    },
}

impl Outcome {
    /// Warnings in the order the checks ran.
    pub fn warnings(&self) -> Vec<&Warning> {
        match self {
            Outcome::Verified {
                resource_groups, ..
            } => resource_groups.warning().into_iter().collect(),
            Outcome::PrincipalDenied {
                resource_groups,
                warning,
                ..
            } => resource_groups
                .warning()
                .into_iter()
                .chain(Some(warning))
                .collect(),
            Outcome::SubscriptionDenied { warning } => vec![warning],
        }
    }
}

/// Returns true if `err` is a 401 or 403 response from Resource Manager.
pub fn is_authorization_failure(err: &CheckError) -> bool {
    matches!(err, CheckError::Response { status: 401 | 403, .. })
}

fn denied(err: &CheckError, problem: String, remedy: String) -> Warning {
    let status = match err {
        CheckError::Response { status, .. } => status.to_string(),
        _ => "unknown".into(),
    };
    Warning {
        problem: format!("{} (status {})", problem, status),
        remedy,
    }
}

/// Returns the ID of the first subscription the identity can see.
pub fn resolve_subscription(arm: &impl ResourceManager) -> Result<Lookup> {
    log::info!("Retrieving subscription ID");
    for page in arm.list_subscriptions() {
        let subscriptions = match page {
            Ok(subscriptions) => subscriptions,
            Err(e) if is_authorization_failure(&e) => {
                return Ok(Lookup::Denied(denied(
                    &e,
                    "Authentication succeeded but the workload identity is not allowed to list subscriptions".into(),
                    "Assign the Reader role to the managed identity on at least one subscription".into(),
                )))
            }
            Err(e) => return Err(e),
        };

        if let Some(subscription) = subscriptions
            .into_iter()
            .find(|s| s.subscription_id.as_deref().is_some_and(|id| !id.is_empty()))
        {
            let id = subscription.subscription_id.unwrap_or_default();
            log::info!(
                "Subscription retrieved: {} ({})",
                subscription.display_name.as_deref().unwrap_or(""),
                id
            );
            return Ok(Lookup::Found(id));
        }
    }

    Err(CheckError::NoSubscriptions)
}

/// Returns the principal ID of the user-assigned managed identity with `client_id`.
pub fn resolve_principal(
    arm: &impl ResourceManager,
    subscription_id: &str,
    client_id: &str,
) -> Result<Lookup> {
    log::info!(
        "Looking up managed identity {} in subscription {}",
        client_id,
        subscription_id
    );
    for page in arm.list_user_assigned_identities(subscription_id) {
        let identities = match page {
            Ok(identities) => identities,
            Err(e) if is_authorization_failure(&e) => {
                return Ok(Lookup::Denied(denied(
                    &e,
                    format!(
                        "Authentication succeeded but the workload identity is not allowed to list managed identities in subscription {}",
                        subscription_id
                    ),
                    format!(
                        "Assign the Managed Identity Operator or Reader role on subscription {} to the managed identity",
                        subscription_id
                    ),
                )))
            }
            Err(e) => return Err(e),
        };

        for identity in identities {
            let Some(properties) = identity.properties else {
                continue;
            };
            if properties.client_id.as_deref() != Some(client_id) {
                continue;
            }
            match properties.principal_id {
                Some(principal_id) if !principal_id.is_empty() => {
                    log::info!(
                        "Managed identity found: {}",
                        identity.name.as_deref().unwrap_or("")
                    );
                    return Ok(Lookup::Found(principal_id));
                }
                _ => log::debug!("Identity with client ID {} has no principal ID", client_id),
            }
        }
    }

    Err(CheckError::NoMatchingIdentity(client_id.into()))
}

/// Lists the resource groups of `subscription_id` as a permission check.
///
/// A denied listing does not stop the probe.
pub fn check_resource_groups(
    arm: &impl ResourceManager,
    subscription_id: &str,
) -> Result<ResourceGroupAccess> {
    log::info!("Listing resource groups in subscription {}", subscription_id);
    let mut found = Vec::new();
    for page in arm.list_resource_groups(subscription_id) {
        match page {
            Ok(groups) => found.extend(groups),
            Err(e) if is_authorization_failure(&e) => {
                return Ok(ResourceGroupAccess::Denied(denied(
                    &e,
                    format!(
                        "Authentication succeeded but the workload identity is not allowed to list resource groups in subscription {}",
                        subscription_id
                    ),
                    format!(
                        "Assign the Reader or Contributor role on subscription {} to the managed identity",
                        subscription_id
                    ),
                )));
            }
            Err(e) => return Err(e),
        }
    }

    log::info!(
        "Permission check passed: found {} resource group(s)",
        found.len()
    );
    for group in &found {
        log::info!(
            " - Name: {}, Location: {}",
            group.name.as_deref().unwrap_or(""),
            group.location.as_deref().unwrap_or("")
        );
    }
    Ok(ResourceGroupAccess::Listed(found.len()))
}

/// Runs the checks in order, stopping at a denied subscription or identity listing.
pub fn probe(config: &Config, arm: &impl ResourceManager) -> Result<Outcome> {
    let subscription_id = match resolve_subscription(arm)? {
        Lookup::Found(id) => id,
        Lookup::Denied(warning) => return Ok(Outcome::SubscriptionDenied { warning }),
    };

    let resource_groups = check_resource_groups(arm, &subscription_id)?;

    match resolve_principal(arm, &subscription_id, &config.client_id)? {
        Lookup::Found(principal_id) => Ok(Outcome::Verified {
            subscription_id,
            resource_groups,
            principal_id,
        }),
        Lookup::Denied(warning) => Ok(Outcome::PrincipalDenied {
            subscription_id,
            resource_groups,
            warning,
        }),
    }
}
