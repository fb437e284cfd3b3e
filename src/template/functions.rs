use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::Utc;
use minijinja::{Environment, Error, ErrorKind, Value};
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    traits::PublicKeyParts,
    BigUint, RsaPrivateKey, RsaPublicKey,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Register the function library, each usable as a filter and as a function
pub(super) fn register(env: &mut Environment<'static>) {
    macro_rules! both {
        ($($name:literal => $f:path),* $(,)?) => {
            $(
                env.add_filter($name, $f);
                env.add_function($name, $f);
            )*
        };
    }

    both! {
        "b64enc" => b64enc,
        "b64dec" => b64dec,
        "toJson" => to_json,
        "fromJson" => from_json,
        "toYaml" => to_yaml,
        "fromYaml" => from_yaml,
        "sha256sum" => sha256sum,
        "trimPrefix" => trim_prefix,
        "trimSuffix" => trim_suffix,
        "quote" => quote,
        "pkcs12key" => pkcs12_key,
        "pkcs12cert" => pkcs12_cert,
        "pemToPkcs12" => pem_to_pkcs12,
        "filterPEM" => filter_pem,
        "filterCertChain" => filter_cert_chain,
        "jwkPublicKeyPem" => jwk_public_key_pem,
        "jwkPrivateKeyPem" => jwk_private_key_pem,
        "pemToJwk" => pem_to_jwk,
    }
    env.add_function("now", now);
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, msg.into())
}

fn b64enc(value: String) -> String {
    STANDARD.encode(value.as_bytes())
}

fn b64dec(value: String) -> Result<String, Error> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|e| invalid(format!("b64dec: invalid base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| invalid(format!("b64dec: not valid UTF-8: {e}")))
}

fn to_json(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| invalid(format!("toJson: {e}")))
}

fn from_json(value: String) -> Result<Value, Error> {
    let parsed: serde_json::Value =
        serde_json::from_str(&value).map_err(|e| invalid(format!("fromJson: {e}")))?;
    Ok(Value::from_serialize(&parsed))
}

fn to_yaml(value: Value) -> Result<String, Error> {
    serde_yaml::to_string(&value).map_err(|e| invalid(format!("toYaml: {e}")))
}

fn from_yaml(value: String) -> Result<Value, Error> {
    let parsed: serde_yaml::Value =
        serde_yaml::from_str(&value).map_err(|e| invalid(format!("fromYaml: {e}")))?;
    Ok(Value::from_serialize(&parsed))
}

fn sha256sum(value: String) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn trim_prefix(value: String, prefix: String) -> String {
    value
        .strip_prefix(prefix.as_str())
        .map(String::from)
        .unwrap_or(value)
}

fn trim_suffix(value: String, suffix: String) -> String {
    value
        .strip_suffix(suffix.as_str())
        .map(String::from)
        .unwrap_or(value)
}

fn quote(value: String) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| invalid(format!("quote: {e}")))
}

/// Current UTC time, RFC 3339 unless a strftime format is given
fn now(format: Option<String>) -> String {
    let now = Utc::now();
    match format {
        Some(f) => now.format(&f).to_string(),
        None => now.to_rfc3339(),
    }
}

fn decode_pfx(archive: &str) -> Result<p12::PFX, Error> {
    let der = STANDARD
        .decode(archive.trim())
        .map_err(|e| invalid(format!("pkcs12: archive is not base64: {e}")))?;
    p12::PFX::parse(&der).map_err(|e| invalid(format!("pkcs12: unable to parse archive: {e:?}")))
}

/// Private key of a base64 encoded PKCS#12 archive, as PKCS#8 PEM
fn pkcs12_key(archive: String, password: Option<String>) -> Result<String, Error> {
    let pfx = decode_pfx(&archive)?;
    let keys = pfx
        .key_bags(password.as_deref().unwrap_or(""))
        .map_err(|e| invalid(format!("pkcs12key: {e:?}")))?;
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| invalid("pkcs12key: archive holds no private key"))?;

    Ok(pem::encode(&pem::Pem::new("PRIVATE KEY", key)))
}

/// Certificates of a base64 encoded PKCS#12 archive, as concatenated PEM
fn pkcs12_cert(archive: String, password: Option<String>) -> Result<String, Error> {
    let pfx = decode_pfx(&archive)?;
    let certs = pfx
        .cert_x509_bags(password.as_deref().unwrap_or(""))
        .map_err(|e| invalid(format!("pkcs12cert: {e:?}")))?;
    if certs.is_empty() {
        return Err(invalid("pkcs12cert: archive holds no certificate"));
    }

    let blocks: Vec<pem::Pem> = certs
        .into_iter()
        .map(|der| pem::Pem::new("CERTIFICATE", der))
        .collect();
    Ok(pem::encode_many(&blocks))
}

/// Assemble a base64 encoded PKCS#12 archive from a PEM certificate chain and key
fn pem_to_pkcs12(cert: String, key: String, password: Option<String>) -> Result<String, Error> {
    let certs: Vec<pem::Pem> = parse_pem(&cert)?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .collect();
    let leaf = certs
        .first()
        .ok_or_else(|| invalid("pemToPkcs12: no certificate found"))?;
    let ca = certs.get(1).map(|p| p.contents());

    let key_der = private_key_pkcs8(&key)?;
    let pfx = p12::PFX::new(
        leaf.contents(),
        &key_der,
        ca,
        password.as_deref().unwrap_or(""),
        "",
    )
    .ok_or_else(|| invalid("pemToPkcs12: unable to assemble archive"))?;

    Ok(STANDARD.encode(pfx.to_der()))
}

fn parse_pem(input: &str) -> Result<Vec<pem::Pem>, Error> {
    pem::parse_many(input).map_err(|e| invalid(format!("invalid PEM: {e}")))
}

fn private_key_pkcs8(input: &str) -> Result<Vec<u8>, Error> {
    let block = parse_pem(input)?
        .into_iter()
        .find(|p| p.tag().ends_with("PRIVATE KEY"))
        .ok_or_else(|| invalid("no private key block found"))?;

    match block.tag() {
        "PRIVATE KEY" => Ok(block.contents().to_vec()),
        "RSA PRIVATE KEY" => {
            let key = RsaPrivateKey::from_pkcs1_der(block.contents())
                .map_err(|e| invalid(format!("invalid RSA key: {e}")))?;
            let der = key
                .to_pkcs8_der()
                .map_err(|e| invalid(format!("unable to encode key: {e}")))?;
            Ok(der.as_bytes().to_vec())
        }
        other => Err(invalid(format!("unsupported key type `{other}`"))),
    }
}

/// Keep only the PEM blocks of the given type
fn filter_pem(input: String, pem_type: String) -> Result<String, Error> {
    let blocks: Vec<pem::Pem> = parse_pem(&input)?
        .into_iter()
        .filter(|p| p.tag() == pem_type)
        .collect();
    if blocks.is_empty() {
        return Err(invalid(format!("filterPEM: no `{pem_type}` block found")));
    }
    Ok(pem::encode_many(&blocks))
}

#[derive(Debug, PartialEq, Eq)]
enum ChainPosition {
    Leaf,
    Intermediate,
    Root,
}

fn chain_position(der: &[u8]) -> Result<ChainPosition, Error> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| invalid(format!("invalid certificate: {e}")))?;
    let self_signed = cert.subject().as_raw() == cert.issuer().as_raw();

    Ok(match (cert.is_ca(), self_signed) {
        (true, true) => ChainPosition::Root,
        (true, false) => ChainPosition::Intermediate,
        (false, _) => ChainPosition::Leaf,
    })
}

/// Keep only the `leaf`, `intermediate` or `root` certificates of a chain
fn filter_cert_chain(input: String, position: String) -> Result<String, Error> {
    let wanted = match position.as_str() {
        "leaf" => ChainPosition::Leaf,
        "intermediate" => ChainPosition::Intermediate,
        "root" => ChainPosition::Root,
        other => {
            return Err(invalid(format!(
                "filterCertChain: unknown position `{other}`, expected leaf, intermediate or root"
            )))
        }
    };

    let mut blocks = Vec::new();
    for block in parse_pem(&input)?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
    {
        if chain_position(block.contents())? == wanted {
            blocks.push(block);
        }
    }
    if blocks.is_empty() {
        return Err(invalid(format!("filterCertChain: no {position} certificate found")));
    }
    Ok(pem::encode_many(&blocks))
}

#[derive(Deserialize)]
struct Jwk {
    kty: String,
    n: Option<String>,
    e: Option<String>,
    d: Option<String>,
    p: Option<String>,
    q: Option<String>,
}

impl Jwk {
    fn parse(input: &str) -> Result<Self, Error> {
        let jwk: Jwk = serde_json::from_str(input).map_err(|e| invalid(format!("invalid JWK: {e}")))?;
        if jwk.kty != "RSA" {
            return Err(invalid(format!("unsupported JWK key type `{}`", jwk.kty)));
        }
        Ok(jwk)
    }

    fn component(value: &Option<String>, name: &str) -> Result<BigUint, Error> {
        let raw = value
            .as_deref()
            .ok_or_else(|| invalid(format!("JWK is missing `{name}`")))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| invalid(format!("JWK `{name}` is not base64url: {e}")))?;
        Ok(BigUint::from_bytes_be(&bytes))
    }
}

fn jwk_public_key_pem(input: String) -> Result<String, Error> {
    let jwk = Jwk::parse(&input)?;
    let key = RsaPublicKey::new(Jwk::component(&jwk.n, "n")?, Jwk::component(&jwk.e, "e")?)
        .map_err(|e| invalid(format!("invalid RSA public key: {e}")))?;
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| invalid(format!("unable to encode key: {e}")))
}

fn jwk_private_key_pem(input: String) -> Result<String, Error> {
    let jwk = Jwk::parse(&input)?;
    let key = RsaPrivateKey::from_components(
        Jwk::component(&jwk.n, "n")?,
        Jwk::component(&jwk.e, "e")?,
        Jwk::component(&jwk.d, "d")?,
        vec![Jwk::component(&jwk.p, "p")?, Jwk::component(&jwk.q, "q")?],
    )
    .map_err(|e| invalid(format!("invalid RSA private key: {e}")))?;
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.to_string())
        .map_err(|e| invalid(format!("unable to encode key: {e}")))
}

/// Public JWK of an RSA public or private key in PEM form
fn pem_to_jwk(input: String) -> Result<String, Error> {
    let key = match RsaPublicKey::from_public_key_pem(&input) {
        Ok(key) => key,
        Err(_) => RsaPrivateKey::from_pkcs8_pem(&input)
            .map(|k| k.to_public_key())
            .map_err(|e| invalid(format!("pemToJwk: unsupported key: {e}")))?,
    };

    let jwk = serde_json::json!({
        "kty": "RSA",
        "n": URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
        "e": URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
    });
    Ok(jwk.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::template::{TemplateEngine, TemplateValue};

    fn render(source: &str, value: &str) -> Result<String, crate::template::Error> {
        let vars = BTreeMap::from([(
            "IN".to_string(),
            TemplateValue {
                value: value.into(),
                secret_path: "/".into(),
            },
        )]);
        TemplateEngine::new().render("OUT", source, &vars)
    }

    #[test]
    fn base64_filters_round_trip_through_templates() {
        assert_eq!(render("{{ IN.Value | b64enc }}", "hello").unwrap(), "aGVsbG8=");
        assert_eq!(render("{{ b64dec(IN.Value) }}", "aGVsbG8=").unwrap(), "hello");
        assert!(render("{{ IN.Value | b64dec }}", "%%%").is_err());
    }

    #[test]
    fn json_and_yaml_conversions() {
        assert_eq!(
            render("{{ (IN.Value | fromJson).user }}", r#"{"user":"app"}"#).unwrap(),
            "app"
        );
        assert_eq!(
            render("{{ (IN.Value | fromYaml).port }}", "port: 5432\n").unwrap(),
            "5432"
        );
        assert_eq!(
            render("{{ (IN.Value | fromJson) | toJson }}", r#"{"a":1}"#).unwrap(),
            r#"{"a":1}"#
        );
    }

    #[test]
    fn string_helpers() {
        assert_eq!(trim_prefix("v1.2".into(), "v".into()), "1.2");
        assert_eq!(trim_suffix("a.txt".into(), ".txt".into()), "a");
        assert_eq!(quote("a\"b".into()).unwrap(), r#""a\"b""#);
        assert_eq!(
            sha256sum("abc".into()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn unknown_chain_position_is_rejected() {
        assert!(filter_cert_chain(String::new(), "middle".into()).is_err());
    }

    #[test]
    fn filter_pem_keeps_matching_blocks() {
        let input = pem::encode_many(&[
            pem::Pem::new("CERTIFICATE", vec![1, 2, 3]),
            pem::Pem::new("PRIVATE KEY", vec![4, 5, 6]),
        ]);
        let out = filter_pem(input, "PRIVATE KEY".into()).unwrap();
        let blocks = pem::parse_many(&out).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].contents(), &[4, 5, 6]);
    }

    #[test]
    fn jwk_rejects_non_rsa_keys() {
        let err = jwk_public_key_pem(r#"{"kty":"EC","crv":"P-256"}"#.into()).unwrap_err();
        assert!(err.to_string().contains("unsupported JWK key type"));
    }

    #[test]
    fn jwk_public_key_round_trips_through_pem() {
        // 2048 bit modulus and the usual public exponent
        let n = URL_SAFE_NO_PAD.encode(
            BigUint::parse_bytes(
                b"c5b5b5d1f3a0d5b3e8f6f7c1a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5\
                  e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5\
                  e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5\
                  e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5\
                  e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5\
                  e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5\
                  e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5\
                  e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d7",
                16,
            )
            .unwrap()
            .to_bytes_be(),
        );
        let jwk = serde_json::json!({ "kty": "RSA", "n": n, "e": "AQAB" }).to_string();

        let pem = jwk_public_key_pem(jwk).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));

        let back: serde_json::Value = serde_json::from_str(&pem_to_jwk(pem).unwrap()).unwrap();
        assert_eq!(back["n"], n);
        assert_eq!(back["e"], "AQAB");
    }
}
