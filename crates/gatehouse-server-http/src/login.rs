//! Login surface served on every tunnel subdomain

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Response, StatusCode};
use axum::response::{Html, IntoResponse, Redirect};
use axum::Form;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use gatehouse_http_auth::paths::{sanitize_return_to, OIDC_CALLBACK_PATH};
use gatehouse_http_auth::{
    authorize_url, clear_session_cookie, email_allowed, session_cookie, AuthContext, AuthOutcome,
    EffectivePolicy, IncomingRequest, IssuedSession, OIDC_METHOD,
};
use gatehouse_store::PolicyType;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::host::{header_pairs, request_subdomain, ClientIp};
use crate::proxy::outcome_response;
use crate::{GatewayError, GatewayState};

/// Cookie carrying the OIDC `state` and return path between login and callback
const OIDC_STATE_COOKIE: &str = "gatehouse_oidc_state";

#[derive(Debug, Default, Deserialize)]
pub struct ReturnTo {
    rd: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    username: String,
    password: String,
    rd: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn resolve(
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<(AuthContext, Arc<EffectivePolicy>), GatewayError> {
    let subdomain =
        request_subdomain(headers, state.domain()).ok_or(GatewayError::TunnelNotFound)?;
    state.resolver.resolve(&subdomain).await.map_err(|e| {
        warn!(subdomain = %subdomain, error = %e, "Policy unavailable for login");
        GatewayError::AuthUnavailable
    })
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn login_page(subdomain: &str, return_to: &str, error: Option<&str>) -> Html<String> {
    let error = error
        .map(|e| format!("<p class=\"error\">{}</p>", escape_html(e)))
        .unwrap_or_default();
    Html(format!(
        "<!doctype html>\n<html><head><title>Sign in to {sub}</title></head><body>\n\
         <h1>Sign in to {sub}</h1>\n{error}\n\
         <form method=\"post\">\n\
         <input type=\"hidden\" name=\"rd\" value=\"{rd}\">\n\
         <label>Username <input name=\"username\" autocomplete=\"username\" required></label>\n\
         <label>Password <input name=\"password\" type=\"password\" autocomplete=\"current-password\" required></label>\n\
         <button type=\"submit\">Sign in</button>\n\
         </form>\n</body></html>\n",
        sub = escape_html(subdomain),
        rd = escape_html(return_to),
        error = error,
    ))
}

pub async fn login_form(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<ReturnTo>,
) -> Result<Html<String>, GatewayError> {
    let (ctx, policy) = resolve(&state, &headers).await?;
    if policy.policy_type != PolicyType::Basic {
        return Err(GatewayError::NotFound);
    }
    Ok(login_page(
        &ctx.subdomain,
        &sanitize_return_to(query.rd.as_deref()),
        None,
    ))
}

pub async fn login_submit(
    State(state): State<Arc<GatewayState>>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<Response<Body>, GatewayError> {
    let (ctx, policy) = resolve(&state, &headers).await?;
    let return_to = sanitize_return_to(form.rd.as_deref());
    let pairs = header_pairs(&headers);
    let request = IncomingRequest::new("POST", &return_to, &pairs, client_ip);

    let outcome = state
        .dispatcher
        .login_basic(&request, &policy, &ctx, &form.username, &form.password)
        .await;
    match outcome {
        AuthOutcome::Authenticated(identity) => {
            info!(subdomain = %ctx.subdomain, identity = %identity.identity, "Login succeeded");
            let jar = match identity.new_session.as_ref() {
                Some(session) => jar.add(session_cookie(session, state.config.secure_cookies)),
                None => jar,
            };
            Ok((jar, Redirect::to(&return_to)).into_response())
        }
        AuthOutcome::Failure(_) => {
            let page = login_page(&ctx.subdomain, &return_to, Some("Invalid username or password"));
            Ok((StatusCode::UNAUTHORIZED, page).into_response())
        }
        other => Ok(outcome_response(other)),
    }
}

pub async fn logout(
    State(state): State<Arc<GatewayState>>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<ReturnTo>,
) -> Result<Response<Body>, GatewayError> {
    let subdomain =
        request_subdomain(&headers, state.domain()).ok_or(GatewayError::TunnelNotFound)?;
    let pairs = header_pairs(&headers);
    let request = IncomingRequest::new("GET", "/", &pairs, client_ip);

    match state.dispatcher.sessions().revoke(&request).await {
        Ok(true) => debug!(subdomain = %subdomain, "Session revoked"),
        Ok(false) => {}
        Err(e) => {
            warn!(subdomain = %subdomain, error = %e, "Failed to revoke session");
            return Err(GatewayError::AuthUnavailable);
        }
    }
    let jar = jar.add(clear_session_cookie(state.config.secure_cookies));
    Ok((jar, Redirect::to(&sanitize_return_to(query.rd.as_deref()))).into_response())
}

fn callback_url(state: &GatewayState, subdomain: &str) -> String {
    format!("{}{}", state.admission.public_url(subdomain), OIDC_CALLBACK_PATH)
}

pub async fn oidc_login(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<ReturnTo>,
) -> Result<Response<Body>, GatewayError> {
    if state.oidc.is_none() {
        return Err(GatewayError::OidcNotConfigured);
    }
    let (ctx, policy) = resolve(&state, &headers).await?;
    let settings = match (&policy.policy_type, &policy.oidc) {
        (PolicyType::Oidc, Some(settings)) => settings,
        _ => return Err(GatewayError::NotFound),
    };

    let nonce = Uuid::new_v4().simple().to_string();
    let return_to = sanitize_return_to(query.rd.as_deref());
    let location = authorize_url(settings, &callback_url(&state, &ctx.subdomain), &nonce);
    let cookie = state_cookie(&nonce, &return_to, state.config.secure_cookies);
    debug!(subdomain = %ctx.subdomain, "Redirecting to identity provider");
    Ok((jar.add(cookie), Redirect::to(&location)).into_response())
}

/// `<state>.<percent-encoded return path>`, good for ten minutes
fn state_cookie(nonce: &str, return_to: &str, secure: bool) -> Cookie<'static> {
    Cookie::build((
        OIDC_STATE_COOKIE,
        format!("{}.{}", nonce, urlencoding::encode(return_to)),
    ))
    .path("/")
    .max_age(time::Duration::minutes(10))
    .http_only(true)
    .same_site(SameSite::Lax)
    .secure(secure)
    .build()
}

/// `(state, return path)` from the state cookie
fn read_state_cookie(jar: &CookieJar) -> Option<(String, String)> {
    let value = jar.get(OIDC_STATE_COOKIE)?.value().to_string();
    let (nonce, encoded) = value.split_once('.')?;
    let return_to = urlencoding::decode(encoded).ok()?.into_owned();
    Some((nonce.to_string(), return_to))
}

pub async fn oidc_callback(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<Response<Body>, GatewayError> {
    let Some(exchange) = state.oidc.clone() else {
        return Err(GatewayError::OidcNotConfigured);
    };
    let (ctx, policy) = resolve(&state, &headers).await?;
    let settings = match (&policy.policy_type, &policy.oidc) {
        (PolicyType::Oidc, Some(settings)) => settings,
        _ => return Err(GatewayError::NotFound),
    };

    if let Some(error) = params.error {
        warn!(subdomain = %ctx.subdomain, error = %error, "Identity provider returned an error");
        return Err(GatewayError::Forbidden);
    }
    let code = params
        .code
        .ok_or_else(|| GatewayError::BadRequest("missing code".to_string()))?;

    let (expected, return_to) = read_state_cookie(&jar)
        .ok_or_else(|| GatewayError::BadRequest("missing login state".to_string()))?;
    if params.state.as_deref() != Some(expected.as_str()) {
        warn!(subdomain = %ctx.subdomain, "OIDC state mismatch");
        return Err(GatewayError::BadRequest("login state mismatch".to_string()));
    }

    let identity = exchange
        .exchange_code(settings, &code, &callback_url(&state, &ctx.subdomain))
        .await
        .map_err(|e| {
            warn!(subdomain = %ctx.subdomain, error = %e, "OIDC code exchange failed");
            GatewayError::Forbidden
        })?;
    if !email_allowed(settings, identity.email.as_deref()) {
        info!(subdomain = %ctx.subdomain, subject = %identity.subject, "OIDC email domain not allowed");
        return Err(GatewayError::Forbidden);
    }

    let session: IssuedSession = state
        .dispatcher
        .sessions()
        .establish(&ctx.subdomain, identity.display(), OIDC_METHOD, policy.session_ttl)
        .await
        .map_err(|e| {
            warn!(subdomain = %ctx.subdomain, error = %e, "Failed to create session");
            GatewayError::AuthUnavailable
        })?;
    info!(subdomain = %ctx.subdomain, identity = %identity.display(), "OIDC login succeeded");

    let jar = jar
        .remove(Cookie::build(OIDC_STATE_COOKIE).path("/"))
        .add(session_cookie(&session, state.config.secure_cookies));
    let location = sanitize_return_to(Some(return_to.as_str()));
    Ok((jar, Redirect::to(&location)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_page_escapes_input() {
        let Html(page) = login_page("demo", "/a?b=\"x\"", Some("<bad>"));
        assert!(page.contains("value=\"/a?b=&quot;x&quot;\""));
        assert!(page.contains("&lt;bad&gt;"));
        assert!(!page.contains("<bad>"));
    }

    #[test]
    fn test_state_cookie_round_trip() {
        let cookie = state_cookie("abc123", "/dash?x=1", true);
        assert_eq!(cookie.value(), "abc123.%2Fdash%3Fx%3D1");
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.max_age(), Some(time::Duration::minutes(10)));

        let jar = CookieJar::new().add(Cookie::new("other", "1")).add(cookie);
        let (nonce, rd) = read_state_cookie(&jar).unwrap();
        assert_eq!(nonce, "abc123");
        assert_eq!(rd, "/dash?x=1");
    }

    #[test]
    fn test_state_cookie_rejects_garbage() {
        let no_separator = CookieJar::new().add(Cookie::new(OIDC_STATE_COOKIE, "abc123"));
        assert!(read_state_cookie(&no_separator).is_none());

        // Not UTF-8 once decoded
        let bad_utf8 = CookieJar::new().add(Cookie::new(OIDC_STATE_COOKIE, "abc.%FF%FE"));
        assert!(read_state_cookie(&bad_utf8).is_none());

        assert!(read_state_cookie(&CookieJar::new()).is_none());
    }
}
