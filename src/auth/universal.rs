use serde_json::json;

use super::{AuthContext, AuthDetails, AuthError, AuthStrategy};
use crate::{resources::read_secret, resources::UniversalAuth, Error, Result};

const CLIENT_ID_KEY: &str = "clientId";
const CLIENT_SECRET_KEY: &str = "clientSecret";

pub(super) async fn login(ctx: &AuthContext<'_>, block: Option<&UniversalAuth>) -> Result<AuthDetails> {
    let strategy = AuthStrategy::Universal;
    let block = block.ok_or_else(|| AuthError::not_configured(strategy))?;
    if block.credentials_ref.secret_name.is_empty() {
        return Err(AuthError::not_configured(strategy));
    }

    let data = read_secret(ctx.client.clone(), ctx.namespace_scope, &block.credentials_ref).await?;
    let (client_id, client_secret) = credentials(&block.credentials_ref.secret_name, &data)?;

    ctx.platform
        .login(
            "universal",
            &json!({ "clientId": client_id, "clientSecret": client_secret }),
        )
        .await?;

    Ok(AuthDetails::machine_identity(strategy, block.secrets_scope.as_ref()))
}

/// Both keys blank means the block is a leftover and another strategy should be tried
fn credentials<'a>(
    secret_name: &str,
    data: &'a std::collections::BTreeMap<String, String>,
) -> Result<(&'a str, &'a str)> {
    let client_id = data.get(CLIENT_ID_KEY).map(|v| v.trim()).unwrap_or_default();
    let client_secret = data.get(CLIENT_SECRET_KEY).map(|v| v.trim()).unwrap_or_default();

    match (client_id.is_empty(), client_secret.is_empty()) {
        (true, true) => Err(AuthError::NotApplicable(format!(
            "{} credentials in secret `{secret_name}` are empty",
            AuthStrategy::Universal
        ))
        .into()),
        (true, false) => Err(Error::MissingSecretKey(secret_name.into(), CLIENT_ID_KEY.into())),
        (false, true) => Err(Error::MissingSecretKey(
            secret_name.into(),
            CLIENT_SECRET_KEY.into(),
        )),
        (false, false) => Ok((client_id, client_secret)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn blank_credentials_are_skipped() {
        let data = BTreeMap::from([("clientId".to_string(), "  ".to_string())]);
        let err = credentials("creds", &data).unwrap_err();
        assert!(matches!(err, Error::AuthError(AuthError::NotApplicable(_))));
    }

    #[test]
    fn half_configured_credentials_are_an_error() {
        let data = BTreeMap::from([("clientId".to_string(), "id".to_string())]);
        let err = credentials("creds", &data).unwrap_err();
        assert!(matches!(err, Error::MissingSecretKey(_, ref key) if key == "clientSecret"));
    }

    #[test]
    fn values_are_trimmed() {
        let data = BTreeMap::from([
            ("clientId".to_string(), "id\n".to_string()),
            ("clientSecret".to_string(), " secret".to_string()),
        ]);
        assert_eq!(credentials("creds", &data).unwrap(), ("id", "secret"));
    }
}
