use crate::error::EtlError;

/// Extract the single `{name}` placeholder from a parameterized endpoint
/// template. Zero or multiple placeholders are config errors; parameter
/// substitution never interpolates arbitrary strings.
pub fn placeholder_name(endpoint: &str) -> Result<String, EtlError> {
    let mut names = Vec::new();
    let mut rest = endpoint;

    while let Some(open) = rest.find('{') {
        let tail = &rest[open + 1..];
        let close = tail.find('}').ok_or_else(|| {
            EtlError::ConfigInvalid(format!("unclosed placeholder in endpoint {endpoint:?}"))
        })?;
        let name = &tail[..close];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(EtlError::ConfigInvalid(format!(
                "invalid placeholder {name:?} in endpoint {endpoint:?}"
            )));
        }
        names.push(name.to_string());
        rest = &tail[close + 1..];
    }

    match names.len() {
        1 => Ok(names.remove(0)),
        0 => Err(EtlError::ConfigInvalid(format!(
            "parameterized endpoint {endpoint:?} has no placeholder"
        ))),
        n => Err(EtlError::ConfigInvalid(format!(
            "parameterized endpoint {endpoint:?} has {n} placeholders, expected exactly one"
        ))),
    }
}

/// Substitute the placeholder with a concrete value.
pub fn substitute(endpoint: &str, name: &str, value: &str) -> String {
    endpoint.replace(&format!("{{{name}}}"), value)
}
