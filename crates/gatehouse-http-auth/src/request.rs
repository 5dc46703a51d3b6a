use cookie::Cookie;
use std::net::IpAddr;

/// The parts of an inbound HTTP request the auth pipeline looks at
#[derive(Debug, Clone, Copy)]
pub struct IncomingRequest<'a> {
    pub method: &'a str,
    /// Path plus query, used as the post-login return target
    pub path: &'a str,
    pub headers: &'a [(String, String)],
    pub client_ip: IpAddr,
}

impl<'a> IncomingRequest<'a> {
    pub fn new(
        method: &'a str,
        path: &'a str,
        headers: &'a [(String, String)],
        client_ip: IpAddr,
    ) -> Self {
        Self {
            method,
            path,
            headers,
            client_ip,
        }
    }

    /// First header with this name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Token from `Authorization: Bearer <token>`
    pub fn bearer_token(&self) -> Option<&'a str> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") {
            let token = token.trim();
            (!token.is_empty()).then_some(token)
        } else {
            None
        }
    }

    /// Value of a cookie, searching every `Cookie` header
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("cookie"))
            .flat_map(|(_, v)| Cookie::split_parse(v.as_str()))
            .filter_map(Result::ok)
            .find(|c| c.name() == name)
            .map(|c| c.value().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn headers() -> Vec<(String, String)> {
        vec![
            ("Host".into(), "demo.example.com".into()),
            ("Authorization".into(), "Bearer ghk_abc".into()),
            ("Cookie".into(), "theme=dark; gatehouse_session=tok123".into()),
        ]
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let h = headers();
        let req = IncomingRequest::new("GET", "/", &h, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(req.header("host"), Some("demo.example.com"));
        assert_eq!(req.header("x-missing"), None);
    }

    #[test]
    fn test_bearer_and_cookie() {
        let h = headers();
        let req = IncomingRequest::new("GET", "/", &h, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(req.bearer_token(), Some("ghk_abc"));
        assert_eq!(req.cookie("gatehouse_session").as_deref(), Some("tok123"));
        assert_eq!(req.cookie("theme").as_deref(), Some("dark"));
        assert_eq!(req.cookie("other"), None);
    }

    #[test]
    fn test_cookie_tolerates_odd_headers() {
        let h = vec![
            ("cookie".to_string(), "broken; theme=dark".to_string()),
            ("Cookie".to_string(), " gatehouse_session = tok456 ".to_string()),
        ];
        let req = IncomingRequest::new("GET", "/", &h, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(req.cookie("theme").as_deref(), Some("dark"));
        assert_eq!(req.cookie("gatehouse_session").as_deref(), Some("tok456"));
    }

    #[test]
    fn test_basic_is_not_bearer() {
        let h = vec![("authorization".to_string(), "Basic dXNlcjpwYXNz".to_string())];
        let req = IncomingRequest::new("GET", "/", &h, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(req.bearer_token(), None);
    }
}
