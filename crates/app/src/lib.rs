#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use delegation_proxy_api::{router, ApiState, ForwardingGateway, DEFAULT_UPSTREAM_SCHEME};
use delegation_proxy_auth::jwt::normalize_issuer;
use delegation_proxy_auth::{
    ClientCredentials, DelegatorCredentialManager, OidcKeyResolver, ProofOfPossessionVerifier,
    ProofSigner, VerifierConfig, DEFAULT_PROOF_MAX_AGE, DEFAULT_SAFETY_MARGIN,
};
use delegation_proxy_core::graph::object_iris;
use delegation_proxy_core::vocab::LOGS_LOGGING_CONTAINER;
use delegation_proxy_core::{DocumentFetcher, HttpDocumentFetcher};
use delegation_proxy_policy::{AccessPolicy, PolicyEvaluator};
use delegation_proxy_provenance::{ContainerSink, DiscardSink, ProvenanceLogger, ProvenanceSink};
use oxrdf::Graph;
use url::Url;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub delegator_web_id: String,
    pub credentials: ClientCredentials,
    pub policy: AccessPolicy,
    pub logging_container: Option<String>,
    pub trusted_issuers: Vec<String>,
    pub proof_max_age: Duration,
    pub token_refresh_margin: Duration,
    pub upstream_scheme: String,
}

/// Raw environment values, kept separate so parsing is testable.
#[derive(Debug, Clone, Default)]
struct ProxyEnv {
    listen_addr: Option<String>,
    delegator_web_id: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    policy_mode: Option<String>,
    policy_document: Option<String>,
    logging_container: Option<String>,
    trusted_issuers: Option<String>,
    proof_max_age_secs: Option<String>,
    token_refresh_margin_secs: Option<String>,
    upstream_scheme: Option<String>,
}

impl ProxyEnv {
    fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self {
            listen_addr: var("LISTEN_ADDR"),
            delegator_web_id: var("DELEGATOR_WEB_ID"),
            client_id: var("CLIENT_ID"),
            client_secret: var("CLIENT_SECRET"),
            policy_mode: var("POLICY_MODE"),
            policy_document: var("POLICY_DOCUMENT"),
            logging_container: var("LOGGING_CONTAINER"),
            trusted_issuers: var("TRUSTED_ISSUERS"),
            proof_max_age_secs: var("PROOF_MAX_AGE_SECS"),
            token_refresh_margin_secs: var("TOKEN_REFRESH_MARGIN_SECS"),
            upstream_scheme: var("UPSTREAM_SCHEME"),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_values(ProxyEnv::from_env())
    }

    fn from_values(env: ProxyEnv) -> anyhow::Result<Self> {
        let listen_addr = non_empty(env.listen_addr);
        let listen_addr = listen_addr.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen_addr = SocketAddr::from_str(listen_addr)
            .map_err(|error| anyhow::anyhow!("invalid LISTEN_ADDR: {error}"))?;

        let delegator_web_id = required(env.delegator_web_id, "DELEGATOR_WEB_ID")?;
        validate_http_url(&delegator_web_id, "DELEGATOR_WEB_ID")?;
        let credentials = ClientCredentials {
            client_id: required(env.client_id, "CLIENT_ID")?,
            client_secret: required(env.client_secret, "CLIENT_SECRET")?,
        };

        let policy_document = non_empty(env.policy_document);
        if let Some(document) = &policy_document {
            validate_http_url(document, "POLICY_DOCUMENT")?;
        }
        let policy = match non_empty(env.policy_mode) {
            None => AccessPolicy::default(),
            Some(mode) => AccessPolicy::from_str(&mode)
                .map_err(|error| anyhow::anyhow!("invalid POLICY_MODE: {error}"))?,
        };
        let policy = match (policy, policy_document) {
            (AccessPolicy::RoleGrant { .. }, document) => AccessPolicy::RoleGrant { document },
            (AccessPolicy::Membership, Some(_)) => {
                return Err(anyhow::anyhow!(
                    "POLICY_DOCUMENT requires POLICY_MODE=role-grant"
                ));
            }
            (policy, None) => policy,
        };

        let logging_container = non_empty(env.logging_container);
        if let Some(container) = &logging_container {
            validate_http_url(container, "LOGGING_CONTAINER")?;
        }

        let trusted_issuers = parse_trusted_issuers(env.trusted_issuers)?;
        let proof_max_age = parse_secs(
            env.proof_max_age_secs,
            "PROOF_MAX_AGE_SECS",
            DEFAULT_PROOF_MAX_AGE,
        )?;
        let token_refresh_margin = parse_secs(
            env.token_refresh_margin_secs,
            "TOKEN_REFRESH_MARGIN_SECS",
            DEFAULT_SAFETY_MARGIN,
        )?;

        let upstream_scheme = non_empty(env.upstream_scheme)
            .unwrap_or_else(|| DEFAULT_UPSTREAM_SCHEME.to_owned());
        if upstream_scheme != "http" && upstream_scheme != "https" {
            return Err(anyhow::anyhow!(
                "invalid UPSTREAM_SCHEME {upstream_scheme:?}: expected \"http\" or \"https\""
            ));
        }

        Ok(Self {
            listen_addr,
            delegator_web_id,
            credentials,
            policy,
            logging_container,
            trusted_issuers,
            proof_max_age,
            token_refresh_margin,
            upstream_scheme,
        })
    }
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let delegator = config.delegator_web_id.as_str();
    let signer = Arc::new(ProofSigner::generate()?);
    tracing::info!(thumbprint = signer.thumbprint(), "generated proxy signing key");

    let documents: Arc<dyn DocumentFetcher> = Arc::new(HttpDocumentFetcher::new());
    let credentials = Arc::new(
        DelegatorCredentialManager::new(Arc::clone(&documents), Arc::clone(&signer))
            .with_safety_margin(config.token_refresh_margin)
            .with_delegator(delegator, config.credentials.clone()),
    );
    match credentials.get_token(delegator).await {
        Ok(_) => tracing::info!(delegator, "logged in as delegator"),
        Err(error) => tracing::warn!(delegator, %error, "could not log in as delegator yet"),
    }

    let container = match &config.logging_container {
        Some(container) => Some(container.clone()),
        None => discover_logging_container(documents.as_ref(), delegator).await,
    };
    let sink: Arc<dyn ProvenanceSink> = match container {
        Some(container) => {
            tracing::info!(%container, "using logging container");
            Arc::new(ContainerSink::new(
                container,
                delegator,
                credentials.clone(),
                Arc::clone(&signer),
            ))
        }
        None => Arc::new(DiscardSink),
    };
    let (logger, _worker) = ProvenanceLogger::spawn(sink);

    let verifier = ProofOfPossessionVerifier::new(
        Arc::new(OidcKeyResolver::default()),
        VerifierConfig {
            trusted_issuers: config.trusted_issuers.clone(),
            proof_max_age: config.proof_max_age,
        },
    );
    let policy = PolicyEvaluator::new(documents, config.policy.clone());
    let state = ApiState::new(
        Arc::new(verifier),
        Arc::new(policy),
        credentials,
        signer,
        Arc::new(ForwardingGateway::new()),
        logger,
        delegator,
    )
    .with_upstream_scheme(&config.upstream_scheme);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(
        addr = %config.listen_addr,
        delegator,
        policy = %config.policy,
        "delegation proxy listening"
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn discover_logging_container(
    documents: &dyn DocumentFetcher,
    delegator: &str,
) -> Option<String> {
    match documents.fetch_graph(delegator).await {
        Ok(profile) => logging_container(&profile, delegator),
        Err(error) => {
            tracing::warn!(
                delegator,
                %error,
                "could not fetch delegator profile for logging container"
            );
            None
        }
    }
}

fn logging_container(profile: &Graph, delegator: &str) -> Option<String> {
    let containers = object_iris(profile, delegator, LOGS_LOGGING_CONTAINER);
    if containers.len() != 1 {
        tracing::warn!(
            delegator,
            found = containers.len(),
            "expected exactly one logging container in the delegator profile"
        );
    }
    containers.into_iter().next()
}

fn parse_trusted_issuers(value: Option<String>) -> anyhow::Result<Vec<String>> {
    let mut issuers = Vec::new();
    for entry in value.unwrap_or_default().split_whitespace() {
        validate_http_url(entry, "issuer")?;
        let normalized = normalize_issuer(entry);
        if !issuers.contains(&normalized) {
            issuers.push(normalized);
        }
    }
    Ok(issuers)
}

fn parse_secs(value: Option<String>, name: &str, default: Duration) -> anyhow::Result<Duration> {
    let Some(value) = non_empty(value) else {
        return Ok(default);
    };
    let secs: u64 = value
        .parse()
        .map_err(|error| anyhow::anyhow!("invalid {name} {value:?}: {error}"))?;
    if secs == 0 {
        return Err(anyhow::anyhow!("invalid {name}: must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

fn required(value: Option<String>, name: &str) -> anyhow::Result<String> {
    non_empty(value).ok_or_else(|| anyhow::anyhow!("{name} must be set"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn validate_http_url(raw: &str, label: &str) -> anyhow::Result<()> {
    let parsed =
        Url::parse(raw).map_err(|error| anyhow::anyhow!("invalid {label} URL {raw:?}: {error}"))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(anyhow::anyhow!(
            "invalid {label} URL {raw:?}: must use http or https"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use delegation_proxy_core::graph::parse_turtle;

    use super::{logging_container, AccessPolicy, AppConfig, ProxyEnv};

    const DELEGATOR: &str = "https://sme.example/profile/card#me";

    fn minimal_env() -> ProxyEnv {
        ProxyEnv {
            delegator_web_id: Some(DELEGATOR.to_owned()),
            client_id: Some("proxy".to_owned()),
            client_secret: Some("secret".to_owned()),
            ..ProxyEnv::default()
        }
    }

    #[test]
    fn from_values_uses_defaults() {
        let config = AppConfig::from_values(minimal_env()).expect("parse config");

        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:3000");
        assert_eq!(config.delegator_web_id, DELEGATOR);
        assert_eq!(config.credentials.client_id, "proxy");
        assert_eq!(config.policy, AccessPolicy::Membership);
        assert_eq!(config.logging_container, None);
        assert!(config.trusted_issuers.is_empty());
        assert_eq!(config.proof_max_age, Duration::from_secs(300));
        assert_eq!(config.token_refresh_margin, Duration::from_secs(540));
        assert_eq!(config.upstream_scheme, "https");
    }

    #[test]
    fn from_values_requires_delegator_and_client() {
        for (env, name) in [
            (
                ProxyEnv {
                    delegator_web_id: None,
                    ..minimal_env()
                },
                "DELEGATOR_WEB_ID",
            ),
            (
                ProxyEnv {
                    client_id: Some("  ".to_owned()),
                    ..minimal_env()
                },
                "CLIENT_ID",
            ),
            (
                ProxyEnv {
                    client_secret: None,
                    ..minimal_env()
                },
                "CLIENT_SECRET",
            ),
        ] {
            let error = AppConfig::from_values(env).expect_err("missing value should fail");
            assert!(error.to_string().contains(name), "{error}");
        }
    }

    #[test]
    fn from_values_validates_listen_addr() {
        let error = AppConfig::from_values(ProxyEnv {
            listen_addr: Some("not-an-address".to_owned()),
            ..minimal_env()
        })
        .expect_err("invalid listen address should fail");

        assert!(error.to_string().contains("LISTEN_ADDR"));
    }

    #[test]
    fn from_values_rejects_non_http_delegator() {
        let error = AppConfig::from_values(ProxyEnv {
            delegator_web_id: Some("did:key:z6Mk".to_owned()),
            ..minimal_env()
        })
        .expect_err("non-http WebID should fail");

        assert!(error.to_string().contains("DELEGATOR_WEB_ID"));
    }

    #[test]
    fn from_values_parses_role_grant_policy() {
        let config = AppConfig::from_values(ProxyEnv {
            policy_mode: Some("role-grant".to_owned()),
            policy_document: Some("https://sme.example/organization.ttl".to_owned()),
            ..minimal_env()
        })
        .expect("parse config");

        assert_eq!(
            config.policy,
            AccessPolicy::RoleGrant {
                document: Some("https://sme.example/organization.ttl".to_owned())
            }
        );
    }

    #[test]
    fn from_values_rejects_unknown_policy_mode() {
        let error = AppConfig::from_values(ProxyEnv {
            policy_mode: Some("acl".to_owned()),
            ..minimal_env()
        })
        .expect_err("unknown policy mode should fail");

        assert!(error.to_string().contains("POLICY_MODE"));
    }

    #[test]
    fn from_values_rejects_policy_document_for_membership() {
        let error = AppConfig::from_values(ProxyEnv {
            policy_document: Some("https://sme.example/organization.ttl".to_owned()),
            ..minimal_env()
        })
        .expect_err("policy document without role-grant should fail");

        assert!(error.to_string().contains("POLICY_DOCUMENT"));
    }

    #[test]
    fn from_values_normalizes_trusted_issuers() {
        let config = AppConfig::from_values(ProxyEnv {
            trusted_issuers: Some("https://idp.example/ https://idp.example https://other.example".to_owned()),
            ..minimal_env()
        })
        .expect("parse config");

        assert_eq!(
            config.trusted_issuers,
            vec!["https://idp.example", "https://other.example"]
        );
    }

    #[test]
    fn from_values_rejects_invalid_issuer_urls() {
        let error = AppConfig::from_values(ProxyEnv {
            trusted_issuers: Some("not-a-url".to_owned()),
            ..minimal_env()
        })
        .expect_err("invalid issuer URL should fail");

        assert!(error.to_string().contains("invalid issuer URL"));
    }

    #[test]
    fn from_values_parses_durations() {
        let config = AppConfig::from_values(ProxyEnv {
            proof_max_age_secs: Some("60".to_owned()),
            token_refresh_margin_secs: Some("120".to_owned()),
            ..minimal_env()
        })
        .expect("parse config");
        assert_eq!(config.proof_max_age, Duration::from_secs(60));
        assert_eq!(config.token_refresh_margin, Duration::from_secs(120));

        for value in ["0", "-5", "five"] {
            let error = AppConfig::from_values(ProxyEnv {
                proof_max_age_secs: Some(value.to_owned()),
                ..minimal_env()
            })
            .expect_err("invalid duration should fail");
            assert!(error.to_string().contains("PROOF_MAX_AGE_SECS"), "{error}");
        }
    }

    #[test]
    fn from_values_validates_upstream_scheme() {
        let config = AppConfig::from_values(ProxyEnv {
            upstream_scheme: Some("http".to_owned()),
            ..minimal_env()
        })
        .expect("parse config");
        assert_eq!(config.upstream_scheme, "http");

        let error = AppConfig::from_values(ProxyEnv {
            upstream_scheme: Some("ftp".to_owned()),
            ..minimal_env()
        })
        .expect_err("ftp should fail");
        assert!(error.to_string().contains("UPSTREAM_SCHEME"));
    }

    #[test]
    fn logging_container_is_read_from_profile() {
        let profile = parse_turtle(
            r#"
                @prefix logs: <https://www.example.org/logs#> .
                <#me> logs:loggingContainer </logs/> .
            "#,
            DELEGATOR,
        )
        .expect("profile");

        assert_eq!(
            logging_container(&profile, DELEGATOR),
            Some("https://sme.example/logs/".to_owned())
        );
    }

    #[test]
    fn logging_container_missing_from_profile() {
        let profile = parse_turtle("<#me> a <#Person> .", DELEGATOR).expect("profile");
        assert_eq!(logging_container(&profile, DELEGATOR), None);
    }
}
