//! Azure Resource Manager listing calls used by the workload identity probe.

use std::marker::PhantomData;

use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize};

use crate::{credential::TokenCredential, CheckError, Result};

pub const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com/";
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";
const MANAGED_IDENTITY_API_VERSION: &str = "2023-01-31";
const RESOURCE_GROUPS_API_VERSION: &str = "2021-04-01";

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Subscription {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct IdentityProperties {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(rename = "principalId")]
    pub principal_id: Option<String>,
    #[serde(rename = "tenantId")]
    pub tenant_id: Option<String>,
}

/// User-assigned managed identity resource
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Identity {
    pub id: Option<String>,
    pub name: Option<String>,
    pub properties: Option<IdentityProperties>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ResourceGroup {
    pub name: Option<String>,
    pub location: Option<String>,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

/// Lazy, forward-only sequence of result pages.
pub type Pages<'a, T> = Box<dyn Iterator<Item = Result<Vec<T>>> + 'a>;

/// The listing operations the probe needs from Resource Manager.
pub trait ResourceManager {
    /// Subscriptions visible to the caller, in the order the service returns them
    fn list_subscriptions(&self) -> Pages<'_, Subscription>;

    /// User-assigned managed identities in `subscription_id`
    fn list_user_assigned_identities(&self, subscription_id: &str) -> Pages<'_, Identity>;

    fn list_resource_groups(&self, subscription_id: &str) -> Pages<'_, ResourceGroup>;
}

pub struct ArmClient<C> {
    credential: C,
    endpoint: Url,
    http: reqwest::blocking::Client,
}

impl<C: TokenCredential> ArmClient<C> {
    pub fn new(credential: C) -> Result<Self> {
        Self::with_endpoint(credential, MANAGEMENT_ENDPOINT)
    }

    pub fn with_endpoint(credential: C, endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            CheckError::Transport(format!("invalid Resource Manager endpoint {:?}: {}", endpoint, e))
        })?;
        Ok(Self {
            credential,
            endpoint,
            http: reqwest::blocking::Client::new(),
        })
    }

    fn url(&self, path: &str, api_version: &str) -> Result<Url> {
        let mut url = self.endpoint.join(path).map_err(|e| {
            CheckError::Transport(format!("invalid request path {:?}: {}", path, e))
        })?;
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }

    fn pages<T: DeserializeOwned + 'static>(&self, first: Result<Url>) -> Pages<'_, T> {
        Box::new(Pager {
            client: self,
            next: Some(first),
            item: PhantomData,
        })
    }

    fn fetch_page<T: DeserializeOwned>(&self, url: Url) -> Result<Page<T>> {
        let token = self.credential.get_token(MANAGEMENT_SCOPE)?;

        log::debug!("GET {}", url);
        let response = match self.http.get(url.clone()).bearer_auth(&token.secret).send() {
            Ok(response) => response,
            Err(e) => {
                return Err(CheckError::Transport(format!(
                    "request to {} failed: {}",
                    url, e
                )))
            }
        };

        let status = response.status();
        if !status.is_success() {
            let (code, message) = match response.json::<ErrorResponse>() {
                Ok(ErrorResponse {
                    error: Some(detail),
                }) => (detail.code, detail.message),
                _ => (None, None),
            };
            return Err(CheckError::Response {
                status: status.as_u16(),
                code,
                message: message.unwrap_or_else(|| {
                    status.canonical_reason().unwrap_or("unknown status").into()
                }),
            });
        }

        response.json::<Page<T>>().map_err(|e| {
            CheckError::Transport(format!("failed to parse response from {}: {}", url, e))
        })
    }
}

impl<C: TokenCredential> ResourceManager for ArmClient<C> {
    fn list_subscriptions(&self) -> Pages<'_, Subscription> {
        self.pages(self.url("subscriptions", SUBSCRIPTIONS_API_VERSION))
    }

    fn list_user_assigned_identities(&self, subscription_id: &str) -> Pages<'_, Identity> {
        let path = format!(
            "subscriptions/{}/providers/Microsoft.ManagedIdentity/userAssignedIdentities",
            subscription_id
        );
        self.pages(self.url(&path, MANAGED_IDENTITY_API_VERSION))
    }

    fn list_resource_groups(&self, subscription_id: &str) -> Pages<'_, ResourceGroup> {
        let path = format!("subscriptions/{}/resourcegroups", subscription_id);
        self.pages(self.url(&path, RESOURCE_GROUPS_API_VERSION))
    }
}

struct Pager<'a, C, T> {
    client: &'a ArmClient<C>,
    // None once the last page was returned or a page failed
    next: Option<Result<Url>>,
    item: PhantomData<T>,
}

impl<C: TokenCredential, T: DeserializeOwned> Iterator for Pager<'_, C, T> {
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let url = match self.next.take()? {
            Ok(url) => url,
            Err(e) => return Some(Err(e)),
        };
        let page = match self.client.fetch_page::<T>(url) {
            Ok(page) => page,
            Err(e) => return Some(Err(e)),
        };
        self.next = page
            .next_link
            .filter(|link| !link.is_empty())
            .map(|link| {
                Url::parse(&link).map_err(|e| {
                    CheckError::Transport(format!("invalid nextLink {:?}: {}", link, e))
                })
            });
        Some(Ok(page.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::AccessToken;
    use crate::probe::{resolve_subscription, Lookup};

    use httpmock::prelude::*;
    use std::time::{Duration, SystemTime};

    struct NoCredential;

    struct StaticCredential;

    impl TokenCredential for StaticCredential {
        fn get_token(&self, scope: &str) -> Result<AccessToken> {
            assert_eq!(scope, MANAGEMENT_SCOPE);
            Ok(AccessToken {
                secret: "arm-token".into(),
                expires_at: SystemTime::now() + Duration::from_secs(3600),
            })
        }
    }

    fn mock_client(server: &MockServer) -> ArmClient<StaticCredential> {
        ArmClient::with_endpoint(StaticCredential, &server.url("/")).unwrap()
    }

    impl TokenCredential for NoCredential {
        fn get_token(&self, _scope: &str) -> Result<AccessToken> {
            Err(CheckError::AuthenticationFailed("no credential".into()))
        }
    }

    #[test]
    fn request_urls() {
        let client = ArmClient::new(NoCredential).unwrap();
        assert_eq!(
            client
                .url("subscriptions", SUBSCRIPTIONS_API_VERSION)
                .unwrap()
                .as_str(),
            "https://management.azure.com/subscriptions?api-version=2022-12-01"
        );
        assert_eq!(
            client
                .url(
                    "subscriptions/sub-1/providers/Microsoft.ManagedIdentity/userAssignedIdentities",
                    MANAGED_IDENTITY_API_VERSION
                )
                .unwrap()
                .as_str(),
            "https://management.azure.com/subscriptions/sub-1/providers/Microsoft.ManagedIdentity/userAssignedIdentities?api-version=2023-01-31"
        );
    }

    #[test]
    fn invalid_endpoint() {
        assert!(matches!(
            ArmClient::with_endpoint(NoCredential, "management"),
            Err(CheckError::Transport(_))
        ));
    }

    #[test]
    fn credential_failure_ends_pages() {
        // the token is requested before any network access
        let client = ArmClient::new(NoCredential).unwrap();
        let mut pages = client.list_subscriptions();
        assert!(matches!(
            pages.next(),
            Some(Err(CheckError::AuthenticationFailed(_)))
        ));
        assert!(pages.next().is_none());
    }

    #[test]
    fn subscription_page() {
        let page: Page<Subscription> = serde_json::from_str(
            r#"{
                "value": [{
                    "id": "/subscriptions/sub-123",
                    "subscriptionId": "sub-123",
                    "tenantId": "tenant",
                    "displayName": "Production",
                    "state": "Enabled",
                    "subscriptionPolicies": {"spendingLimit": "Off"}
                }],
                "nextLink": "https://management.azure.com/subscriptions?api-version=2022-12-01&$skiptoken=abc"
            }"#,
        )
        .unwrap();
        assert_eq!(
            page.value,
            vec![Subscription {
                subscription_id: Some("sub-123".into()),
                display_name: Some("Production".into()),
                state: Some("Enabled".into()),
            }]
        );
        assert!(page.next_link.is_some());
    }

    #[test]
    fn identity_page() {
        let page: Page<Identity> = serde_json::from_str(
            r#"{
                "value": [{
                    "id": "/subscriptions/sub-123/resourcegroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/workload",
                    "name": "workload",
                    "location": "westeurope",
                    "properties": {
                        "tenantId": "tenant",
                        "principalId": "princ-456",
                        "clientId": "client-1"
                    }
                }]
            }"#,
        )
        .unwrap();
        let properties = page.value[0].properties.as_ref().unwrap();
        assert_eq!(properties.client_id.as_deref(), Some("client-1"));
        assert_eq!(properties.principal_id.as_deref(), Some("princ-456"));
        assert!(page.next_link.is_none());
    }

    #[test]
    fn empty_page() {
        let page: Page<Identity> = serde_json::from_str("{}").unwrap();
        assert!(page.value.is_empty());
    }

    #[test]
    fn forbidden_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/subscriptions")
                .query_param("api-version", SUBSCRIPTIONS_API_VERSION)
                .header("authorization", "Bearer arm-token");
            then.status(403)
                .header("content-type", "application/json")
                .body(r#"{"error":{"code":"AuthorizationFailed","message":"The client does not have authorization to perform action"}}"#);
        });

        let client = mock_client(&server);
        let mut pages = client.list_subscriptions();
        assert_eq!(
            pages.next(),
            Some(Err(CheckError::Response {
                status: 403,
                code: Some("AuthorizationFailed".into()),
                message: "The client does not have authorization to perform action".into(),
            }))
        );
        assert!(pages.next().is_none());

        let Ok(Lookup::Denied(warning)) = resolve_subscription(&client) else {
            panic!("expected denied lookup");
        };
        assert!(warning.problem.contains("status 403"));
    }

    #[test]
    fn server_error_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/subscriptions");
            then.status(500);
        });

        let client = mock_client(&server);
        assert_eq!(
            resolve_subscription(&client),
            Err(CheckError::Response {
                status: 500,
                code: None,
                message: "Internal Server Error".into(),
            })
        );
    }

    #[test]
    fn pages_follow_next_link() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(GET).path("/subscriptions");
            then.status(200)
                .header("content-type", "application/json")
                .body(format!(
                    r#"{{"value":[{{"displayName":"no id"}}],"nextLink":"{}"}}"#,
                    server.url("/subscriptions-page-2?api-version=2022-12-01")
                ));
        });
        let second = server.mock(|when, then| {
            when.method(GET).path("/subscriptions-page-2");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"value":[{"subscriptionId":"sub-123"},{"subscriptionId":"sub-456"}],"nextLink":""}"#);
        });

        let client = mock_client(&server);
        let pages: Vec<_> = client.list_subscriptions().collect();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].as_ref().map(|page| page.len()), Ok(2));
        first.assert_hits(1);
        second.assert_hits(1);

        assert_eq!(
            resolve_subscription(&client),
            Ok(Lookup::Found("sub-123".into()))
        );
    }

    #[test]
    fn null_value_is_malformed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/subscriptions/sub-123/resourcegroups")
                .query_param("api-version", RESOURCE_GROUPS_API_VERSION);
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"value":null}"#);
        });

        let client = mock_client(&server);
        let mut pages = client.list_resource_groups("sub-123");
        assert!(matches!(pages.next(), Some(Err(CheckError::Transport(_)))));
        assert!(pages.next().is_none());
    }

    #[test]
    fn resource_group_page() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/subscriptions/sub-123/resourcegroups")
                .query_param("api-version", RESOURCE_GROUPS_API_VERSION);
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"value":[{"id":"/subscriptions/sub-123/resourceGroups/aks-rg","name":"aks-rg","location":"westeurope","properties":{"provisioningState":"Succeeded"}}]}"#);
        });

        let client = mock_client(&server);
        let pages: Vec<_> = client.list_resource_groups("sub-123").collect();
        assert_eq!(
            pages,
            vec![Ok(vec![ResourceGroup {
                name: Some("aks-rg".into()),
                location: Some("westeurope".into()),
            }])]
        );
    }
}
