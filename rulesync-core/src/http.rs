//! Helpers shared by the HTTP adapters.

use std::time::Duration;

use reqwest::{ClientBuilder, Response, StatusCode, Url};

use crate::contract::AdapterError;

pub(crate) const USER_AGENT: &str = concat!("rulesync/", env!("CARGO_PKG_VERSION"));

/// Client builder with the per-call timeout every adapter uses.
pub(crate) fn client_builder(timeout: Duration) -> Result<ClientBuilder, AdapterError> {
    if timeout.is_zero() {
        return Err(AdapterError::Transport("request timeout must be positive".into()));
    }
    Ok(reqwest::Client::builder().timeout(timeout).user_agent(USER_AGENT))
}

/// Appends `segments` to `base`, percent-encoding each one as a single path segment.
pub(crate) fn join_segments<'a, I>(base: &Url, segments: I) -> Result<Url, AdapterError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| AdapterError::Transport(format!("{base} cannot be used as a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Turns a non-2xx response into the matching [`AdapterError`].
pub(crate) async fn status_error(resp: Response) -> AdapterError {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| String::from("<failed to decode response body>"));
    match status {
        StatusCode::NOT_FOUND => AdapterError::NotFound,
        StatusCode::CONFLICT => AdapterError::Conflict(body),
        _ => AdapterError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

/// Passes 2xx responses through, everything else becomes an error.
pub(crate) async fn ensure_success(resp: Response) -> Result<Response, AdapterError> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(status_error(resp).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_are_encoded_individually() {
        let base = Url::parse("https://gitlab.local/api/v4/projects/").unwrap();
        let url = join_segments(&base, ["secops/detections", "repository", "files", "rules/a%2Eb.json"]).unwrap();
        assert_eq!(
            url.path(),
            "/api/v4/projects/secops%2Fdetections/repository/files/rules%2Fa%252Eb.json"
        );
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(client_builder(Duration::ZERO).is_err());
        assert!(client_builder(Duration::from_secs(5)).is_ok());
    }
}
