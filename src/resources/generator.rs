use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A cluster wide source of generated values
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "ClusterGenerator",
    group = "secrets.infisical.com",
    version = "v1alpha1",
    printcolumn = r#"{ "name": "kind", "type": "string", "description": "generator kind", "jsonPath": ".spec.generator.kind" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGeneratorSpec {
    pub generator: GeneratorDefinition,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorDefinition {
    pub kind: GeneratorKind,

    #[serde(default)]
    pub password_spec: Option<PasswordSpec>,

    #[serde(default)]
    pub uuid_spec: Option<UuidSpec>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum GeneratorKind {
    #[default]
    Password,
    #[serde(rename = "UUID")]
    Uuid,
}

/// Shape of a generated password
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSpec {
    #[serde(default = "defaults::length")]
    pub length: usize,

    /// Number of digits, a quarter of the length when unset
    #[serde(default)]
    pub digits: Option<usize>,

    /// Number of symbols, a quarter of the length when unset
    #[serde(default)]
    pub symbols: Option<usize>,

    /// Alphabet symbols are drawn from
    #[serde(default)]
    pub symbol_characters: Option<String>,

    /// Only use lowercase letters
    #[serde(default)]
    pub no_upper: bool,

    /// Allow a character to appear more than once
    #[serde(default)]
    pub allow_repeat: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct UuidSpec {}

impl Default for PasswordSpec {
    fn default() -> Self {
        Self {
            length: defaults::length(),
            digits: None,
            symbols: None,
            symbol_characters: None,
            no_upper: false,
            allow_repeat: false,
        }
    }
}

mod defaults {
    pub fn length() -> usize {
        24
    }
}
