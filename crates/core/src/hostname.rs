use thiserror::Error;

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Normalizes a tenant supplied hostname.
///
/// Strips an `http://`/`https://` prefix, any path, port or trailing dot and
/// lowercases the result. The `www.` prefix is preserved; callers decide which
/// form they need through [`apex_form`] and [`www_form`].
pub fn normalize_hostname(input: &str) -> Result<String, HostnameError> {
    let lowered = input.trim().to_ascii_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let host = without_scheme.split('/').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    let host = host.trim_end_matches('.');

    if host.is_empty() {
        return Err(HostnameError::Empty);
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err(HostnameError::TooLong(host.len()));
    }
    if !host.contains('.') {
        return Err(HostnameError::NotQualified(host.to_string()));
    }

    for label in host.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(HostnameError::InvalidLabel(host.to_string()));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(HostnameError::InvalidLabel(host.to_string()));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(HostnameError::InvalidCharacters(host.to_string()));
        }
    }

    Ok(host.to_string())
}

/// Returns the hostname without a leading `www.` label.
pub fn apex_form(hostname: &str) -> &str {
    hostname.strip_prefix("www.").unwrap_or(hostname)
}

/// Returns the `www.` form of the hostname.
pub fn www_form(hostname: &str) -> String {
    format!("www.{}", apex_form(hostname))
}

/// Reasons a hostname is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostnameError {
    #[error("hostname is empty")]
    Empty,
    #[error("hostname exceeds {MAX_HOSTNAME_LEN} characters ({0})")]
    TooLong(usize),
    #[error("hostname must be fully qualified: {0}")]
    NotQualified(String),
    #[error("hostname has an invalid label: {0}")]
    InvalidLabel(String),
    #[error("hostname contains invalid characters: {0}")]
    InvalidCharacters(String),
}
