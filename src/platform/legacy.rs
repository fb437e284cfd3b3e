//! Client side decryption for the deprecated service token and service account credentials.
//!
//! Secrets fetched with those credentials arrive end-to-end encrypted with a
//! project key that is itself wrapped for the credential holder.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use aes_gcm::{
    aead::{consts::U16, generic_array::GenericArray, Aead, KeyInit},
    aes::Aes256,
    AesGcm,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use crypto_box::{PublicKey, SalsaBox, SecretKey};

use super::{EncryptedSecret, Error, Result, Secret};

/// Legacy payloads use a 16 byte IV
type Aes256Gcm16 = AesGcm<Aes256, U16>;

const TAG_LEN: usize = 16;
const BOX_NONCE_LEN: usize = 24;

fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| Error::Decryption(format!("`{field}` is not valid base64: {e}")))
}

/// AES-256-GCM with either a 12 or a 16 byte IV
pub fn decrypt_symmetric(key: &[u8], ciphertext: &[u8], iv: &[u8], tag: &[u8]) -> Result<Vec<u8>> {
    if tag.len() != TAG_LEN {
        return Err(Error::Decryption(format!("tag must be {TAG_LEN} bytes")));
    }

    let mut sealed = Vec::with_capacity(ciphertext.len() + tag.len());
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    let invalid_key = |_| Error::Decryption("key must be 32 bytes".into());
    let failed = |_| Error::Decryption("authentication failed".into());
    match iv.len() {
        12 => aes_gcm::Aes256Gcm::new_from_slice(key)
            .map_err(invalid_key)?
            .decrypt(GenericArray::from_slice(iv), sealed.as_slice())
            .map_err(failed),
        16 => Aes256Gcm16::new_from_slice(key)
            .map_err(invalid_key)?
            .decrypt(GenericArray::from_slice(iv), sealed.as_slice())
            .map_err(failed),
        n => Err(Error::Decryption(format!("unsupported IV length {n}"))),
    }
}

/// Unwrap a project key with a base64 encoded NaCl box keypair
pub fn decrypt_project_key(
    encrypted_key: &str,
    nonce: &str,
    public_key: &str,
    private_key: &str,
) -> Result<Vec<u8>> {
    let ciphertext = decode("encryptedKey", encrypted_key)?;
    let nonce = decode("nonce", nonce)?;
    let public: [u8; 32] = decode("publicKey", public_key)?
        .try_into()
        .map_err(|_| Error::Decryption("public key must be 32 bytes".into()))?;
    let private: [u8; 32] = decode("privateKey", private_key)?
        .try_into()
        .map_err(|_| Error::Decryption("private key must be 32 bytes".into()))?;

    if nonce.len() != BOX_NONCE_LEN {
        return Err(Error::Decryption(format!("nonce must be {BOX_NONCE_LEN} bytes")));
    }

    SalsaBox::new(&PublicKey::from(public), &SecretKey::from(private))
        .decrypt(GenericArray::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| Error::Decryption("unable to open project key".into()))
}

/// Decrypt a project key wrapped with the secret part of a service token
pub fn decrypt_service_token_key(
    token_secret: &str,
    encrypted_key: &str,
    iv: &str,
    tag: &str,
) -> Result<Vec<u8>> {
    decrypt_symmetric(
        token_secret.as_bytes(),
        &decode("encryptedKey", encrypted_key)?,
        &decode("iv", iv)?,
        &decode("tag", tag)?,
    )
}

fn decrypt_field(key: &[u8], name: &str, ciphertext: &str, iv: &str, tag: &str) -> Result<String> {
    let plain = decrypt_symmetric(
        key,
        &decode(name, ciphertext)?,
        &decode(name, iv)?,
        &decode(name, tag)?,
    )?;
    String::from_utf8(plain).map_err(|_| Error::Decryption(format!("{name} is not valid UTF-8")))
}

/// Decrypt secret keys and values with the project key
pub fn decrypt_secrets(project_key: &[u8], secrets: &[EncryptedSecret]) -> Result<Vec<Secret>> {
    secrets
        .iter()
        .map(|s| {
            Ok(Secret {
                id: s.id.clone(),
                key: decrypt_field(
                    project_key,
                    "secret key",
                    &s.secret_key_ciphertext,
                    &s.secret_key_iv,
                    &s.secret_key_tag,
                )?,
                value: decrypt_field(
                    project_key,
                    "secret value",
                    &s.secret_value_ciphertext,
                    &s.secret_value_iv,
                    &s.secret_value_tag,
                )?,
                kind: s.kind.clone(),
                path: None,
                workspace: String::new(),
            })
        })
        .collect()
}

/// A `${env.folder.KEY}` reference into another environment or folder
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Folder {
    pub environment: String,
    pub secret_path: String,
}

/// Every `${...}` expression in a value
fn references(value: &str) -> Vec<&str> {
    let mut refs = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                refs.push(&after[..end]);
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    refs
}

fn split_reference(reference: &str) -> Option<(Folder, &str)> {
    let parts: Vec<&str> = reference.split('.').collect();
    if parts.len() < 2 {
        return None;
    }

    let folders = &parts[1..parts.len() - 1];
    let secret_path = if folders.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", folders.join("/"))
    };

    Some((
        Folder {
            environment: parts[0].to_string(),
            secret_path,
        },
        parts[parts.len() - 1],
    ))
}

/// Folders that must be fetched before references can be expanded
pub fn referenced_folders(secrets: &[Secret]) -> BTreeSet<Folder> {
    secrets
        .iter()
        .flat_map(|s| references(&s.value))
        .filter_map(|r| split_reference(r).map(|(folder, _)| folder))
        .collect()
}

struct Expander<'a> {
    local: HashMap<&'a str, &'a str>,
    remote: &'a HashMap<Folder, BTreeMap<String, String>>,
    expanded: HashMap<String, String>,
    visiting: HashSet<String>,
}

impl Expander<'_> {
    fn resolve(&mut self, reference: &str) -> String {
        if let Some(done) = self.expanded.get(reference) {
            return done.clone();
        }

        let raw = match split_reference(reference) {
            None => self.local.get(reference).map(|v| v.to_string()),
            Some((folder, key)) => self
                .remote
                .get(&folder)
                .and_then(|secrets| secrets.get(key))
                .cloned(),
        };

        // Unknown and cyclic references expand to nothing
        let Some(raw) = raw else {
            return String::new();
        };
        if !self.visiting.insert(reference.to_string()) {
            return String::new();
        }

        let mut value = raw.clone();
        for inner in references(&raw) {
            let resolved = self.resolve(inner);
            value = value.replace(&format!("${{{inner}}}"), &resolved);
        }

        self.visiting.remove(reference);
        self.expanded.insert(reference.to_string(), value.clone());
        value
    }
}

/// Replace `${KEY}` and `${env.folder.KEY}` references in secret values.
///
/// `remote` holds the secrets of every folder named by [`referenced_folders`].
pub fn expand_references(
    secrets: Vec<Secret>,
    remote: &HashMap<Folder, BTreeMap<String, String>>,
) -> Vec<Secret> {
    let originals: Vec<(String, String)> = secrets
        .iter()
        .map(|s| (s.key.clone(), s.value.clone()))
        .collect();
    let mut expander = Expander {
        local: originals
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect(),
        remote,
        expanded: HashMap::new(),
        visiting: HashSet::new(),
    };

    secrets
        .into_iter()
        .map(|mut secret| {
            if !references(&secret.value).is_empty() {
                secret.value = expander.resolve(&secret.key);
            }
            secret
        })
        .collect()
}
