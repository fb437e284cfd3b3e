//! AWS IAM login: a signed `sts:GetCallerIdentity` request which the platform replays
//! to learn the caller's identity.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::{AuthContext, AuthDetails, AuthError, AuthStrategy};
use crate::{resources::AwsIamAuth, Result};

type HmacSha256 = Hmac<Sha256>;

const STS_HOST: &str = "sts.amazonaws.com";
const STS_REGION: &str = "us-east-1";
const STS_BODY: &str = "Action=GetCallerIdentity&Version=2011-06-15";
const STS_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

const IMDS: &str = "http://169.254.169.254/latest";
const IMDS_TOKEN_TTL: &str = "21600";

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        Some(Self {
            access_key_id,
            secret_access_key,
            token: std::env::var("AWS_SESSION_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }

    /// Instance role credentials through IMDSv2
    async fn from_instance_metadata(http: &reqwest::Client) -> reqwest::Result<Self> {
        let token = http
            .put(format!("{IMDS}/api/token"))
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let roles = http
            .get(format!("{IMDS}/meta-data/iam/security-credentials/"))
            .header("X-aws-ec2-metadata-token", &token)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let role = roles.lines().next().unwrap_or_default().trim().to_string();

        http.get(format!("{IMDS}/meta-data/iam/security-credentials/{role}"))
            .header("X-aws-ec2-metadata-token", &token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

/// A request to sign with Signature Version 4
pub(crate) struct SignableRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    /// Extra headers to sign, lower case names
    pub headers: BTreeMap<String, String>,
    pub body: &'a [u8],
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

pub(crate) fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date);
    let k_region = hmac(&k_date, region);
    let k_service = hmac(&k_region, service);
    hmac(&k_service, "aws4_request")
}

/// Sign `request`, returning every header to send including `authorization`
pub(crate) fn sign(
    request: &SignableRequest<'_>,
    credentials: &AwsCredentials,
    region: &str,
    service: &str,
    now: DateTime<Utc>,
) -> BTreeMap<String, String> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut headers = request.headers.clone();
    headers.insert("host".into(), request.host.into());
    headers.insert("x-amz-date".into(), amz_date.clone());
    if let Some(token) = &credentials.token {
        headers.insert("x-amz-security-token".into(), token.clone());
    }

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{}\n", v.trim()))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n\n{canonical_headers}\n{signed_headers}\n{}",
        request.method,
        request.path,
        hex_sha256(request.body)
    );

    let scope = format!("{date}/{region}/{service}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex_sha256(canonical_request.as_bytes())
    );
    let signature = hex::encode(hmac(
        &signing_key(&credentials.secret_access_key, &date, region, service),
        &string_to_sign,
    ));

    headers.insert(
        "authorization".into(),
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        ),
    );
    headers
}

/// Header names as the platform expects them when replaying the request
fn canonical_case(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn login_body(identity_id: &str, credentials: &AwsCredentials, now: DateTime<Utc>) -> serde_json::Value {
    let request = SignableRequest {
        method: "POST",
        host: STS_HOST,
        path: "/",
        headers: BTreeMap::from([
            ("content-type".to_string(), STS_CONTENT_TYPE.to_string()),
            ("content-length".to_string(), STS_BODY.len().to_string()),
        ]),
        body: STS_BODY.as_bytes(),
    };
    let headers: BTreeMap<String, String> = sign(&request, credentials, STS_REGION, "sts", now)
        .into_iter()
        .map(|(k, v)| (canonical_case(&k), v))
        .collect();

    json!({
        "identityId": identity_id,
        "iamHttpRequestMethod": "POST",
        "iamRequestUrl": STANDARD.encode(format!("https://{STS_HOST}/")),
        "iamRequestBody": STANDARD.encode(STS_BODY),
        "iamRequestHeaders": STANDARD.encode(serde_json::to_vec(&headers).unwrap_or_default()),
    })
}

pub(super) async fn login(ctx: &AuthContext<'_>, block: Option<&AwsIamAuth>) -> Result<AuthDetails> {
    let strategy = AuthStrategy::AwsIam;
    let block = block
        .filter(|b| !b.identity_id.trim().is_empty())
        .ok_or_else(|| AuthError::not_configured(strategy))?;

    let credentials = match AwsCredentials::from_env() {
        Some(credentials) => credentials,
        None => AwsCredentials::from_instance_metadata(&ctx.metadata_client()?)
            .await
            .map_err(|e| AuthError::provider(strategy, format!("no AWS credentials available: {e}")))?,
    };

    let body = login_body(block.identity_id.trim(), &credentials, Utc::now());
    ctx.platform.login("aws", &body).await?;

    Ok(AuthDetails::machine_identity(strategy, block.secrets_scope.as_ref()))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const EXAMPLE_SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";

    #[test]
    fn signing_keys_are_derived_per_day_region_and_service() {
        let key = signing_key(EXAMPLE_SECRET, "20120215", "us-east-1", "iam");
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn plain_get_requests_sign_like_the_reference_suite() {
        let credentials = AwsCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: EXAMPLE_SECRET.into(),
            token: None,
        };
        let request = SignableRequest {
            method: "GET",
            host: "example.amazonaws.com",
            path: "/",
            headers: BTreeMap::new(),
            body: b"",
        };
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();

        let headers = sign(&request, &credentials, "us-east-1", "service", now);
        assert_eq!(
            headers["authorization"],
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
             SignedHeaders=host;x-amz-date, \
             Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        );
    }

    #[test]
    fn login_bodies_carry_the_signed_sts_request() {
        let credentials = AwsCredentials {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            token: Some("session".into()),
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let body = login_body("identity", &credentials, now);

        assert_eq!(body["identityId"], "identity");
        let url = STANDARD.decode(body["iamRequestUrl"].as_str().unwrap()).unwrap();
        assert_eq!(url, b"https://sts.amazonaws.com/");

        let headers = STANDARD
            .decode(body["iamRequestHeaders"].as_str().unwrap())
            .unwrap();
        let headers: BTreeMap<String, String> = serde_json::from_slice(&headers).unwrap();
        assert_eq!(headers["X-Amz-Date"], "20240102T030405Z");
        assert_eq!(headers["X-Amz-Security-Token"], "session");
        assert_eq!(headers["Host"], "sts.amazonaws.com");
        assert!(headers["Authorization"].contains(
            "SignedHeaders=content-length;content-type;host;x-amz-date;x-amz-security-token"
        ));
    }

    #[test]
    fn header_names_are_title_cased() {
        assert_eq!(canonical_case("x-amz-security-token"), "X-Amz-Security-Token");
        assert_eq!(canonical_case("host"), "Host");
    }
}
