//! Handshake headers for the upstream recognition socket.

pub const HEADER_APP_ID: &str = "X-Api-App-Id";
pub const HEADER_APP_KEY: &str = "X-Api-App-Key";
pub const HEADER_ACCESS_KEY: &str = "X-Api-Access-Key";
pub const HEADER_RESOURCE_ID: &str = "X-Api-Resource-Id";
pub const HEADER_CONNECT_ID: &str = "X-Api-Connect-Id";
pub const HEADER_REQUEST_ID: &str = "X-Api-Request-Id";

/// Inputs for [`build_auth_headers`].
#[derive(Debug, Clone, Default)]
pub struct AuthParams<'a> {
    pub app_id: &'a str,
    pub access_key: &'a str,
    pub resource_id: &'a str,
    pub connect_id: Option<&'a str>,
    /// Overrides the app key header; falls back to `app_id`.
    pub app_key: Option<&'a str>,
    pub request_id: Option<&'a str>,
}

/// Build the ordered handshake header list.
///
/// The app id and app key headers carry the same value unless `app_key` is
/// given. Optional ids are left out entirely when absent or empty.
pub fn build_auth_headers(params: &AuthParams<'_>) -> Vec<(&'static str, String)> {
    let app_key = params
        .app_key
        .filter(|k| !k.is_empty())
        .unwrap_or(params.app_id);

    let mut headers = vec![
        (HEADER_APP_ID, params.app_id.to_string()),
        (HEADER_APP_KEY, app_key.to_string()),
        (HEADER_ACCESS_KEY, params.access_key.to_string()),
        (HEADER_RESOURCE_ID, params.resource_id.to_string()),
    ];
    if let Some(id) = params.connect_id.filter(|id| !id.is_empty()) {
        headers.push((HEADER_CONNECT_ID, id.to_string()));
    }
    if let Some(id) = params.request_id.filter(|id| !id.is_empty()) {
        headers.push((HEADER_REQUEST_ID, id.to_string()));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn app_key_falls_back_to_app_id() {
        let headers: HashMap<_, _> = build_auth_headers(&AuthParams {
            app_id: "app-id",
            access_key: "access-key",
            resource_id: "resource-id",
            connect_id: Some("connect-id"),
            app_key: None,
            request_id: Some("request-id"),
        })
        .into_iter()
        .collect();

        assert_eq!(headers.len(), 6);
        assert_eq!(headers[HEADER_APP_ID], "app-id");
        assert_eq!(headers[HEADER_APP_KEY], "app-id");
        assert_eq!(headers[HEADER_ACCESS_KEY], "access-key");
        assert_eq!(headers[HEADER_RESOURCE_ID], "resource-id");
        assert_eq!(headers[HEADER_CONNECT_ID], "connect-id");
        assert_eq!(headers[HEADER_REQUEST_ID], "request-id");
    }

    #[test]
    fn explicit_app_key_wins() {
        let headers = build_auth_headers(&AuthParams {
            app_id: "app-id",
            access_key: "k",
            resource_id: "r",
            app_key: Some("other-key"),
            ..Default::default()
        });
        assert!(headers.contains(&(HEADER_APP_KEY, "other-key".to_string())));
        assert!(headers.contains(&(HEADER_APP_ID, "app-id".to_string())));
    }

    #[test]
    fn optional_ids_are_omitted() {
        let headers = build_auth_headers(&AuthParams {
            app_id: "a",
            access_key: "k",
            resource_id: "r",
            connect_id: Some(""),
            ..Default::default()
        });
        let names: Vec<_> = headers.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            [HEADER_APP_ID, HEADER_APP_KEY, HEADER_ACCESS_KEY, HEADER_RESOURCE_ID]
        );
    }
}
