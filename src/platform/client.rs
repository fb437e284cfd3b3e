use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{header, Certificate, Method, RequestBuilder, Response, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use super::{
    merge_imports, CreateLeaseRequest, CreatedLease, EncryptedSecret, Error, Lease, LeaseScope,
    ListSecretsRequest, ListSecretsResponse, MachineIdentityToken, PlatformApi, Project,
    ProjectSelector, Result, Secret, SecretTarget, ServiceAccountKey, ServiceTokenDetails,
    USER_AGENT,
};
use crate::config::PlatformSettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Tokens closer than this to expiry are renewed before use
const RENEW_BEFORE_EXPIRY: i64 = 10;

#[derive(Clone, Debug)]
enum Credential {
    /// Machine identity token which can be renewed until its max TTL
    MachineIdentity {
        token: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        max_expires_at: DateTime<Utc>,
    },
    /// Deprecated credentials sent as is
    Static(String),
}

#[derive(Debug, PartialEq, Eq)]
enum TokenState {
    Valid,
    Renew,
    Expired,
}

/// `secs` after `now`, saturating at the last representable instant
fn seconds_after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    chrono::Duration::from_std(Duration::from_secs(secs))
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Credential {
    fn machine_identity(login: MachineIdentityToken, now: DateTime<Utc>) -> Self {
        let expires_at = seconds_after(now, login.expires_in);
        let max_expires_at = if login.access_token_max_ttl == 0 {
            expires_at
        } else {
            seconds_after(now, login.access_token_max_ttl)
        };

        Credential::MachineIdentity {
            token: login.access_token,
            issued_at: now,
            expires_at,
            max_expires_at,
        }
    }

    fn state(&self, now: DateTime<Utc>) -> TokenState {
        match self {
            Credential::Static(_) => TokenState::Valid,
            Credential::MachineIdentity {
                expires_at,
                max_expires_at,
                ..
            } => {
                let remaining = (*expires_at - now).num_seconds();
                if remaining >= RENEW_BEFORE_EXPIRY {
                    TokenState::Valid
                } else if (*max_expires_at - now).num_seconds() > RENEW_BEFORE_EXPIRY {
                    TokenState::Renew
                } else {
                    TokenState::Expired
                }
            }
        }
    }

    fn token(&self) -> &str {
        match self {
            Credential::MachineIdentity { token, .. } | Credential::Static(token) => token,
        }
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "reqId")]
    req_id: Option<String>,
}

/// Client for one platform host, holding the credential established by authentication
pub struct PlatformClient {
    base: Url,
    http: reqwest::Client,
    /// Long lived event streams must not time out
    streaming: reqwest::Client,
    credential: RwLock<Option<Credential>>,
}

impl std::fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformClient")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl PlatformClient {
    pub fn new(settings: &PlatformSettings) -> Result<Self> {
        let mut raw = settings.host_api.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw).map_err(|_| Error::InvalidUrl(settings.host_api.clone()))?;

        let mut http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT);
        let mut streaming = reqwest::Client::builder().user_agent(USER_AGENT);

        if let Some(bundle) = &settings.ca_certificate {
            for certificate in parse_certificates(bundle)? {
                http = http.add_root_certificate(certificate.clone());
                streaming = streaming.add_root_certificate(certificate);
            }
        }

        Ok(Self {
            base,
            http: http.build()?,
            streaming: streaming.build()?,
            credential: RwLock::new(None),
        })
    }

    pub fn host(&self) -> &str {
        self.base.as_str()
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|_| Error::InvalidUrl(format!("{}{path}", self.base)))
    }

    /// Use a deprecated credential as bearer token
    pub fn set_static_token(&self, token: impl Into<String>) {
        *self.credential.write() = Some(Credential::Static(token.into()));
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential.read().is_some()
    }

    /// Exchange a provider specific payload for a machine identity token
    #[instrument(skip(self, body), fields(host = %self.base))]
    pub async fn login(&self, provider: &str, body: &(impl Serialize + Sync)) -> Result<()> {
        let request = self
            .http
            .post(self.url(&format!("v1/auth/{provider}-auth/login"))?)
            .json(body);
        let login: MachineIdentityToken = self.execute(request).await?;

        debug!(provider, expires_in = login.expires_in, "logged in");
        *self.credential.write() = Some(Credential::machine_identity(login, Utc::now()));
        Ok(())
    }

    /// Current bearer token, renewed when about to expire
    async fn bearer(&self) -> Result<String> {
        let credential = self
            .credential
            .read()
            .clone()
            .ok_or(Error::Unauthenticated)?;

        match credential.state(Utc::now()) {
            TokenState::Valid => Ok(credential.token().to_string()),
            TokenState::Expired => Err(Error::TokenExpired),
            TokenState::Renew => {
                let request = self
                    .http
                    .post(self.url("v1/auth/token/renew")?)
                    .json(&json!({ "accessToken": credential.token() }));
                let renewed: MachineIdentityToken = self.execute(request).await?;

                let Credential::MachineIdentity {
                    issued_at,
                    max_expires_at,
                    ..
                } = credential
                else {
                    return Err(Error::TokenExpired);
                };
                let now = Utc::now();
                let token = renewed.access_token.clone();
                *self.credential.write() = Some(Credential::MachineIdentity {
                    token: renewed.access_token,
                    issued_at,
                    expires_at: seconds_after(now, renewed.expires_in),
                    max_expires_at,
                });
                debug!("renewed access token");
                Ok(token)
            }
        }
    }

    async fn authed(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.bearer().await?;
        Ok(self
            .http
            .request(method, self.url(path)?)
            .bearer_auth(token)
            .header(header::ACCEPT, "application/json"))
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let request = request.build()?;
        let method = request.method().clone();
        let response = check(&method, self.http.execute(request).await?).await?;
        Ok(serde_json::from_slice(&response.bytes().await?)?)
    }

    /// Open the project event stream, returning the raw response body to read events from
    pub async fn subscribe_project_events(
        &self,
        project_id: &str,
        environment: &str,
        secret_path: &str,
    ) -> Result<Response> {
        let token = self.bearer().await?;
        let conditions = json!({
            "environmentSlug": environment,
            "secretPath": secret_path,
        });
        let register: Vec<_> = [
            "secret:create",
            "secret:update",
            "secret:delete",
            "secret:import-mutation",
        ]
        .iter()
        .map(|event| json!({ "event": event, "conditions": conditions }))
        .collect();

        let request = self
            .streaming
            .post(self.url("v1/events/subscribe/project-events")?)
            .bearer_auth(token)
            .header(header::ACCEPT, "text/event-stream")
            .json(&json!({ "projectId": project_id, "register": register }))
            .build()?;

        check(&Method::POST, self.streaming.execute(request).await?).await
    }

    /// Project a deprecated service token grants access to
    pub async fn service_token_details(&self) -> Result<ServiceTokenDetails> {
        let request = self.authed(Method::GET, "v2/service-token").await?;
        self.execute(request).await
    }

    /// Id of the service account behind a deprecated access key
    pub async fn service_account_id(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct Account {
            #[serde(alias = "_id")]
            id: String,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            service_account: Account,
        }

        let request = self.authed(Method::GET, "v2/service-accounts/me").await?;
        let response: Response = self.execute(request).await?;
        Ok(response.service_account.id)
    }

    pub async fn service_account_keys(&self, account_id: &str) -> Result<Vec<ServiceAccountKey>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            service_account_keys: Vec<ServiceAccountKey>,
        }

        let request = self
            .authed(Method::GET, &format!("v2/service-accounts/{account_id}/keys"))
            .await?;
        let response: Response = self.execute(request).await?;
        Ok(response.service_account_keys)
    }

    /// End-to-end encrypted secrets, with the encrypted secrets of every import appended
    pub async fn list_encrypted_secrets(
        &self,
        project_id: &str,
        environment: &str,
        secret_path: &str,
        recursive: bool,
    ) -> Result<(Vec<EncryptedSecret>, Vec<Vec<EncryptedSecret>>)> {
        #[derive(Deserialize)]
        struct Import {
            #[serde(default)]
            secrets: Vec<EncryptedSecret>,
        }
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            secrets: Vec<EncryptedSecret>,
            #[serde(default)]
            imports: Vec<Import>,
        }

        let request = self.authed(Method::GET, "v3/secrets").await?.query(&[
            ("workspaceId", project_id),
            ("environment", environment),
            ("secretPath", secret_path),
            ("recursive", if recursive { "true" } else { "false" }),
            ("include_imports", "true"),
        ]);
        let response: Response = self.execute(request).await?;
        Ok((
            response.secrets,
            response.imports.into_iter().map(|i| i.secrets).collect(),
        ))
    }
}

/// Split a PEM bundle into certificates
fn parse_certificates(bundle: &str) -> Result<Vec<Certificate>> {
    let blocks = pem::parse_many(bundle).map_err(|e| Error::InvalidCertificate(e.to_string()))?;
    if blocks.is_empty() {
        return Err(Error::InvalidCertificate("no PEM blocks found".into()));
    }

    blocks
        .iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| {
            Certificate::from_der(block.contents())
                .map_err(|e| Error::InvalidCertificate(e.to_string()))
        })
        .collect()
}

/// Turn non-success responses into [`Error::Api`], carrying the platform's message and request id
async fn check(method: &Method, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let (message, request_id) = match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(parsed) => (
            parsed.message.unwrap_or_else(|| body.clone()),
            parsed.req_id.unwrap_or_default(),
        ),
        Err(_) => (body, String::new()),
    };

    Err(Error::Api {
        method: method.to_string(),
        url,
        status: status.as_u16(),
        message,
        request_id,
    })
}

#[async_trait]
impl PlatformApi for PlatformClient {
    #[instrument(skip(self))]
    async fn list_secrets(&self, request: &ListSecretsRequest) -> Result<Vec<Secret>> {
        let (project_param, project) = match &request.project {
            ProjectSelector::Id(id) => ("workspaceId", id.as_str()),
            ProjectSelector::Slug(slug) => ("workspaceSlug", slug.as_str()),
        };
        let flag = |b: bool| if b { "true" } else { "false" };

        let builder = self.authed(Method::GET, "v3/secrets/raw").await?.query(&[
            (project_param, project),
            ("environment", request.environment.as_str()),
            ("secretPath", request.secret_path.as_str()),
            ("recursive", flag(request.recursive)),
            ("include_imports", flag(request.include_imports)),
            ("expandSecretReferences", flag(request.expand_references)),
        ]);
        let response: ListSecretsResponse = self.execute(builder).await?;

        Ok(if request.include_imports {
            merge_imports(response.secrets, response.imports)
        } else {
            response.secrets
        })
    }

    async fn create_secret(&self, target: &SecretTarget, key: &str, value: &str) -> Result<Secret> {
        write_secret(self, Method::POST, target, key, Some(value)).await
    }

    async fn update_secret(&self, target: &SecretTarget, key: &str, value: &str) -> Result<Secret> {
        write_secret(self, Method::PATCH, target, key, Some(value)).await
    }

    async fn delete_secret(&self, target: &SecretTarget, key: &str) -> Result<Secret> {
        write_secret(self, Method::DELETE, target, key, None).await
    }

    async fn get_project_by_id(&self, id: &str) -> Result<Project> {
        #[derive(Deserialize)]
        struct Response {
            workspace: Project,
        }

        let builder = self.authed(Method::GET, &format!("v1/workspace/{id}")).await?;
        let response: Response = self.execute(builder).await?;
        Ok(response.workspace)
    }

    async fn get_project_by_slug(&self, slug: &str) -> Result<Project> {
        let builder = self.authed(Method::GET, &format!("v2/workspace/{slug}")).await?;
        self.execute(builder).await
    }

    #[instrument(skip(self))]
    async fn create_lease(&self, request: &CreateLeaseRequest) -> Result<CreatedLease> {
        let builder = self
            .authed(Method::POST, "v1/dynamic-secrets/leases")
            .await?
            .json(request);
        self.execute(builder).await
    }

    #[instrument(skip(self))]
    async fn renew_lease(&self, id: &str, scope: &LeaseScope, ttl: Option<&str>) -> Result<Lease> {
        #[derive(Deserialize)]
        struct Response {
            lease: Lease,
        }

        let mut body = serde_json::to_value(scope)?;
        if let Some(ttl) = ttl {
            body["ttl"] = json!(ttl);
        }
        let builder = self
            .authed(Method::POST, &format!("v1/dynamic-secrets/leases/{id}/renew"))
            .await?
            .json(&body);
        let response: Response = self.execute(builder).await
            .map_err(Error::into_lease_error)?;
        Ok(response.lease)
    }

    #[instrument(skip(self))]
    async fn delete_lease(&self, id: &str, scope: &LeaseScope) -> Result<Lease> {
        #[derive(Deserialize)]
        struct Response {
            lease: Lease,
        }

        let builder = self
            .authed(Method::DELETE, &format!("v1/dynamic-secrets/leases/{id}"))
            .await?
            .json(scope);
        let response: Response = self.execute(builder).await?;
        Ok(response.lease)
    }
}

async fn write_secret(
    client: &PlatformClient,
    method: Method,
    target: &SecretTarget,
    key: &str,
    value: Option<&str>,
) -> Result<Secret> {
    #[derive(Deserialize)]
    struct Response {
        secret: Secret,
    }

    let mut body = json!({
        "workspaceId": target.project_id,
        "environment": target.environment,
        "secretPath": target.secret_path,
        "type": "shared",
    });
    if let Some(value) = value {
        body["secretValue"] = json!(value);
    }

    let builder = client
        .authed(method, &format!("v3/secrets/raw/{key}"))
        .await?
        .json(&body);
    let response: Response = client.execute(builder).await?;
    Ok(response.secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(host: &str) -> PlatformSettings {
        PlatformSettings {
            host_api: host.into(),
            ca_certificate: None,
        }
    }

    fn login(expires_in: u64, max_ttl: u64) -> MachineIdentityToken {
        MachineIdentityToken {
            access_token: "t".into(),
            expires_in,
            access_token_max_ttl: max_ttl,
        }
    }

    #[test]
    fn paths_join_below_the_api_prefix() {
        let client = PlatformClient::new(&settings("https://app.infisical.com/api")).unwrap();
        assert_eq!(
            client.url("/v3/secrets/raw").unwrap().as_str(),
            "https://app.infisical.com/api/v3/secrets/raw"
        );

        let client = PlatformClient::new(&settings("https://eu.infisical.com/api/")).unwrap();
        assert_eq!(
            client.url("v1/workspace/p1").unwrap().as_str(),
            "https://eu.infisical.com/api/v1/workspace/p1"
        );
    }

    #[test]
    fn malformed_hosts_are_rejected() {
        assert!(matches!(
            PlatformClient::new(&settings("not a url")),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn garbage_ca_bundles_are_rejected() {
        let settings = PlatformSettings {
            host_api: "https://infisical.internal/api".into(),
            ca_certificate: Some("definitely not pem".into()),
        };
        assert!(matches!(
            PlatformClient::new(&settings),
            Err(Error::InvalidCertificate(_))
        ));
    }

    #[test]
    fn token_renews_near_expiry_until_max_ttl() {
        let now = Utc::now();
        let credential = Credential::machine_identity(login(60, 600), now);

        assert_eq!(credential.state(now), TokenState::Valid);
        assert_eq!(
            credential.state(now + chrono::Duration::seconds(55)),
            TokenState::Renew
        );
        assert_eq!(
            credential.state(now + chrono::Duration::seconds(595)),
            TokenState::Expired
        );
    }

    #[test]
    fn tokens_without_max_ttl_expire_with_their_ttl() {
        let now = Utc::now();
        let credential = Credential::machine_identity(login(60, 0), now);
        assert_eq!(
            credential.state(now + chrono::Duration::seconds(55)),
            TokenState::Expired
        );
    }

    #[test]
    fn huge_token_lifetimes_saturate() {
        let now = Utc::now();
        let credential = Credential::machine_identity(login(u64::MAX, u64::MAX), now);
        assert_eq!(credential.state(now), TokenState::Valid);
        assert_eq!(seconds_after(now, u64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(seconds_after(now, 60), now + chrono::Duration::seconds(60));
    }

    #[test]
    fn static_tokens_never_expire() {
        let credential = Credential::Static("st.abc.def".into());
        assert_eq!(
            credential.state(Utc::now() + chrono::Duration::days(365)),
            TokenState::Valid
        );
    }

    #[tokio::test]
    async fn requests_need_a_credential() {
        let client = PlatformClient::new(&settings("https://app.infisical.com/api")).unwrap();
        assert!(!client.is_authenticated());
        assert!(matches!(client.bearer().await, Err(Error::Unauthenticated)));

        client.set_static_token("st.abc.def");
        assert_eq!(client.bearer().await.unwrap(), "st.abc.def");
    }
}
