//! Verification of webhook senders
//!
//! Each configured client is keyed by a service account. A request is
//! accepted when one client's scheme verifies it, and is then authorized
//! with that service account's token.

pub mod dispatch;
pub mod signature;

pub use dispatch::{Event, EventDispatcher, LoggingDispatcher};

use std::collections::BTreeMap;

use http::HeaderMap;
use tracing::{debug, warn};

use crate::cluster::SharedClient;
use crate::errors::WfError;
use crate::storage::settings::WebhookClient;
use signature::{constant_time_eq, Algorithm, Encoding};

pub const GITHUB_SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const GITLAB_TOKEN_HEADER: &str = "X-Gitlab-Token";
pub const BITBUCKET_UUID_HEADER: &str = "X-Hook-UUID";
pub const GENERIC_DEFAULT_HEADER: &str = "X-Hub-Signature";

/// Key of the token in a service account token secret
pub const TOKEN_KEY: &str = "token";

/// How a client proves it sent a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
    /// HMAC-SHA256 of the body in `X-Hub-Signature-256`
    GitHub,
    /// Shared secret in `X-Gitlab-Token`
    GitLab,
    /// Webhook UUID in `X-Hook-UUID`
    Bitbucket,
    /// HMAC of the body in a configurable header
    Generic {
        header: String,
        algorithm: Algorithm,
        encoding: Encoding,
    },
}

impl Scheme {
    pub fn from_client(client: &WebhookClient) -> Result<Self, WfError> {
        match client.client_type.to_ascii_lowercase().as_str() {
            "github" => Ok(Self::GitHub),
            "gitlab" => Ok(Self::GitLab),
            "bitbucket" => Ok(Self::Bitbucket),
            "generic" => {
                let algorithm = Algorithm::parse(&client.algorithm).ok_or_else(|| {
                    WfError::BadRequest(format!("unsupported webhook algorithm '{}'", client.algorithm))
                })?;
                let encoding = Encoding::parse(&client.encoding).ok_or_else(|| {
                    WfError::BadRequest(format!("unsupported webhook encoding '{}'", client.encoding))
                })?;
                let header = if client.header.is_empty() {
                    GENERIC_DEFAULT_HEADER.to_string()
                } else {
                    client.header.clone()
                };
                Ok(Self::Generic {
                    header,
                    algorithm,
                    encoding,
                })
            }
            other => Err(WfError::BadRequest(format!("unsupported webhook client type '{}'", other))),
        }
    }

    /// Whether `headers` and `body` were produced by a holder of `secret`
    pub fn verify(&self, secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
        match self {
            Self::GitHub => header_str(headers, GITHUB_SIGNATURE_HEADER).is_some_and(|sig| {
                signature::verify(Algorithm::Sha256, Encoding::Hex, secret.as_bytes(), body, sig)
            }),
            Self::GitLab => header_str(headers, GITLAB_TOKEN_HEADER)
                .is_some_and(|token| constant_time_eq(token, secret)),
            Self::Bitbucket => header_str(headers, BITBUCKET_UUID_HEADER)
                .is_some_and(|uuid| constant_time_eq(uuid, secret)),
            Self::Generic {
                header,
                algorithm,
                encoding,
            } => header_str(headers, header).is_some_and(|sig| {
                signature::verify(*algorithm, *encoding, secret.as_bytes(), body, sig)
            }),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

struct Client {
    service_account: String,
    secret: String,
    scheme: Scheme,
}

/// Matches requests to configured clients and fetches their tokens
pub struct Verifier {
    clients: Vec<Client>,
    cluster: SharedClient,
}

impl Verifier {
    /// Clients with an unusable configuration are skipped with a warning
    pub fn new(clients: &BTreeMap<String, WebhookClient>, cluster: SharedClient) -> Self {
        let clients = clients
            .iter()
            .filter_map(|(service_account, client)| match Scheme::from_client(client) {
                Ok(scheme) => Some(Client {
                    service_account: service_account.clone(),
                    secret: client.secret.clone(),
                    scheme,
                }),
                Err(e) => {
                    warn!(service_account = %service_account, "ignoring webhook client: {}", e);
                    None
                }
            })
            .collect();
        Self { clients, cluster }
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Service account of the first client that verifies the request
    pub fn identify(&self, headers: &HeaderMap, body: &[u8]) -> Option<&str> {
        self.clients
            .iter()
            .find(|client| client.scheme.verify(&client.secret, headers, body))
            .map(|client| client.service_account.as_str())
    }

    /// Bearer token of `service_account` in `namespace`
    pub async fn token(&self, namespace: &str, service_account: &str) -> Result<String, WfError> {
        let secret_name = token_secret_name(service_account);
        debug!(namespace, secret = %secret_name, "reading service account token");
        let token = self.cluster.get_secret(namespace, &secret_name, TOKEN_KEY).await?;
        Ok(token.trim().to_string())
    }
}

/// Name of the token secret bound to a service account
pub fn token_secret_name(service_account: &str) -> String {
    format!("{}.service-account-token", service_account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterClient, InMemoryCluster, ResourceType};
    use http::HeaderValue;
    use serde_json::json;
    use std::sync::Arc;

    fn client(client_type: &str, secret: &str) -> WebhookClient {
        WebhookClient {
            client_type: client_type.to_string(),
            secret: secret.to_string(),
            ..Default::default()
        }
    }

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_github_signature() {
        let body = b"{\"action\":\"opened\"}";
        let sig = format!(
            "sha256={}",
            signature::sign(Algorithm::Sha256, Encoding::Hex, b"gh", body)
        );
        let scheme = Scheme::from_client(&client("github", "gh")).unwrap();
        assert!(scheme.verify("gh", &headers(GITHUB_SIGNATURE_HEADER, &sig), body));
        assert!(!scheme.verify("gh", &headers(GITHUB_SIGNATURE_HEADER, &sig), b"{}"));
        assert!(!scheme.verify("gh", &HeaderMap::new(), body));
    }

    #[test]
    fn test_token_schemes() {
        let gitlab = Scheme::from_client(&client("gitlab", "t0k")).unwrap();
        assert!(gitlab.verify("t0k", &headers(GITLAB_TOKEN_HEADER, "t0k"), b""));
        assert!(!gitlab.verify("t0k", &headers(GITLAB_TOKEN_HEADER, "nope"), b""));

        let bitbucket = Scheme::from_client(&client("bitbucket", "uuid-1")).unwrap();
        assert!(bitbucket.verify("uuid-1", &headers(BITBUCKET_UUID_HEADER, "uuid-1"), b""));
        assert!(!bitbucket.verify("uuid-1", &headers(GITLAB_TOKEN_HEADER, "uuid-1"), b""));
    }

    #[test]
    fn test_generic_scheme() {
        let mut config = client("generic", "k");
        config.header = "X-Signature".to_string();
        config.algorithm = "sha1".to_string();
        config.encoding = "base64".to_string();
        let scheme = Scheme::from_client(&config).unwrap();
        let sig = signature::sign(Algorithm::Sha1, Encoding::Base64, b"k", b"payload");
        assert!(scheme.verify("k", &headers("X-Signature", &sig), b"payload"));
        assert!(!scheme.verify("k", &headers(GENERIC_DEFAULT_HEADER, &sig), b"payload"));

        config.algorithm = "md5".to_string();
        assert!(Scheme::from_client(&config).is_err());
        assert!(Scheme::from_client(&client("svn", "k")).is_err());
    }

    #[tokio::test]
    async fn test_identify_and_token() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster
            .create(
                &ResourceType::secret(),
                "argo",
                &json!({
                    "metadata": {"name": "ci.service-account-token"},
                    "stringData": {"token": "abc\n"}
                }),
            )
            .await
            .unwrap();
        let mut clients = BTreeMap::new();
        clients.insert("ci".to_string(), client("gitlab", "s"));
        clients.insert("broken".to_string(), client("svn", "s"));
        let verifier = Verifier::new(&clients, cluster);

        assert!(!verifier.is_empty());
        assert_eq!(verifier.identify(&headers(GITLAB_TOKEN_HEADER, "s"), b""), Some("ci"));
        assert_eq!(verifier.identify(&headers(GITLAB_TOKEN_HEADER, "x"), b""), None);
        assert_eq!(verifier.token("argo", "ci").await.unwrap(), "abc");
        assert!(verifier.token("argo", "other").await.unwrap_err().is_not_found());
    }
}
