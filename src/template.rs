use std::{borrow::Cow, collections::BTreeMap};

use lazy_static::lazy_static;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use thiserror::Error;

use crate::resources::SecretTemplate;

mod functions;

lazy_static! {
    static ref ENGINE: TemplateEngine = TemplateEngine::new();
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to compile template `{key}`: {source}")]
    Compile {
        key: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("unable to execute template `{key}`: {source}")]
    Execute {
        key: String,
        #[source]
        source: minijinja::Error,
    },
}

/// What a template sees for every secret, addressed as `KEY.Value` and `KEY.SecretPath`
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TemplateValue {
    #[serde(rename = "Value")]
    pub value: String,

    #[serde(rename = "SecretPath")]
    pub secret_path: String,
}

/// Sandboxed template renderer.
///
/// Undefined variables are errors, and no registered function can reach the
/// process environment or the filesystem.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        functions::register(&mut env);

        Self { env }
    }

    /// Render a single template
    pub fn render(
        &self,
        key: &str,
        source: &str,
        vars: &BTreeMap<String, TemplateValue>,
    ) -> Result<String, Error> {
        let source = normalize(source);
        let template = self
            .env
            .template_from_str(&source)
            .map_err(|source| Error::Compile {
                key: key.into(),
                source,
            })?;

        template.render(vars).map_err(|source| Error::Execute {
            key: key.into(),
            source,
        })
    }

    /// Render every template, failing on the first error
    pub fn render_all(
        &self,
        templates: &BTreeMap<String, String>,
        vars: &BTreeMap<String, TemplateValue>,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        templates
            .iter()
            .map(|(key, source)| Ok((key.clone(), self.render(key, source, vars)?.into_bytes())))
            .collect()
    }
}

/// Compute the data written for a destination.
///
/// Without a template every secret passes through. With one, templated keys
/// are written and overlay the raw secrets only when `includeAllSecrets` is set.
pub fn project(
    template: Option<&SecretTemplate>,
    vars: &BTreeMap<String, TemplateValue>,
) -> Result<BTreeMap<String, Vec<u8>>, Error> {
    let mut out = BTreeMap::new();
    if template.map_or(true, |t| t.include_all_secrets) {
        out.extend(
            vars.iter()
                .map(|(k, v)| (k.clone(), v.value.clone().into_bytes())),
        );
    }

    if let Some(template) = template {
        out.extend(ENGINE.render_all(&template.data, vars)?);
    }

    Ok(out)
}

/// Accept Go style field access (`{{ .KEY.Value }}`) by dropping the leading dot of an expression
fn normalize(source: &str) -> Cow<'_, str> {
    if !source.contains('.') {
        return Cow::Borrowed(source);
    }

    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            let mut j = i + 2;
            if j < bytes.len() && bytes[j] == b'-' {
                j += 1;
            }
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            let starts_field = j + 1 < bytes.len()
                && bytes[j] == b'.'
                && (bytes[j + 1].is_ascii_alphabetic() || bytes[j + 1] == b'_');
            if starts_field {
                out.push_str(&source[last..j]);
                last = j + 1;
            }
            i = j;
            continue;
        }
        i += 1;
    }

    if last == 0 {
        return Cow::Borrowed(source);
    }
    out.push_str(&source[last..]);
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, TemplateValue> {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    TemplateValue {
                        value: v.to_string(),
                        secret_path: "/".into(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn go_style_leading_dots_are_accepted() {
        assert_eq!(normalize("{{ .API_KEY.Value }}"), "{{ API_KEY.Value }}");
        assert_eq!(normalize("{{- .A.Value -}}"), "{{- A.Value -}}");
        assert_eq!(normalize("x{{.A.Value}}y"), "x{{A.Value}}y");
        assert_eq!(normalize("{{ 1.5 }}"), "{{ 1.5 }}");
        assert!(matches!(normalize("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn templates_see_value_and_path() {
        let engine = TemplateEngine::new();
        let out = engine
            .render(
                "DSN",
                "postgres://{{ USER.Value }}:{{ .PASS.Value }}@db{{ USER.SecretPath }}",
                &vars(&[("USER", "app"), ("PASS", "hunter2")]),
            )
            .unwrap();
        assert_eq!(out, "postgres://app:hunter2@db/");
    }

    #[test]
    fn undefined_variables_fail() {
        let engine = TemplateEngine::new();
        let err = engine
            .render("OUT", "{{ MISSING.Value }}", &vars(&[]))
            .unwrap_err();
        assert!(matches!(err, Error::Execute { ref key, .. } if key == "OUT"));
    }

    #[test]
    fn syntax_errors_fail_compilation() {
        let engine = TemplateEngine::new();
        let err = engine.render("OUT", "{{ A.Value ", &vars(&[("A", "1")])).unwrap_err();
        assert!(matches!(err, Error::Compile { .. }));
    }

    #[test]
    fn projection_without_template_passes_through() {
        let out = project(None, &vars(&[("API_KEY", "abc")])).unwrap();
        assert_eq!(out["API_KEY"], b"abc");
    }

    #[test]
    fn projection_only_writes_templated_keys_unless_including_all() {
        let template = SecretTemplate {
            include_all_secrets: false,
            data: BTreeMap::from([("URL".into(), "https://{{ HOST.Value }}".into())]),
        };
        let secrets = vars(&[("HOST", "example.com")]);

        let out = project(Some(&template), &secrets).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out["URL"], b"https://example.com");

        let template = SecretTemplate {
            include_all_secrets: true,
            data: BTreeMap::from([("HOST".into(), "{{ HOST.Value | upper }}".into())]),
        };
        let out = project(Some(&template), &secrets).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out["HOST"], b"EXAMPLE.COM");
    }
}
