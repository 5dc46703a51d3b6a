//! Reserved paths served by the gateway itself on every tunnel subdomain

/// Requests under this prefix never reach a tunnel
pub const INTERNAL_PREFIX: &str = "/_gatehouse";
pub const TUNNEL_PATH: &str = "/_gatehouse/tunnel";
pub const LOGIN_PATH: &str = "/_gatehouse/login";
pub const LOGOUT_PATH: &str = "/_gatehouse/logout";
pub const OIDC_LOGIN_PATH: &str = "/_gatehouse/oidc/login";
pub const OIDC_CALLBACK_PATH: &str = "/_gatehouse/oidc/callback";

pub fn is_internal(path: &str) -> bool {
    path == INTERNAL_PREFIX || path.starts_with("/_gatehouse/")
}

/// `<login_path>?rd=<return path>`
pub fn with_return_to(login_path: &str, return_to: &str) -> String {
    format!("{}?rd={}", login_path, urlencoding::encode(return_to))
}

/// A post-login target must stay on the same host
pub fn sanitize_return_to(rd: Option<&str>) -> String {
    match rd {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}
