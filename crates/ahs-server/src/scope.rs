//! Per-connection scope: request metadata captured at the WebSocket
//! handshake, enriched by the connect pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;

use ahs_core::{AhsError, AhsResult, Identity, Session};
use uuid::Uuid;

/// Cookie carrying the bearer token.
pub const TOKEN_COOKIE: &str = "ahs_token";
/// Cookie carrying the sealed session.
pub const SESSION_COOKIE: &str = "ahs_session";

/// Route values parsed from `/ws/<app_name>/<page_name>/<socket_url>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub app_name: Option<String>,
    pub page_name: Option<String>,
    pub socket_url: Option<String>,
}

impl Route {
    /// Parse a socket path. Accepts `/ws/`, `/ws/<socket_url>/` and
    /// `/ws/<app>/<page>/<socket_url>/`; `socket_url` must be a UUID.
    pub fn parse(path: &str) -> AhsResult<Self> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let rest = match segments.split_first() {
            Some((&"ws", rest)) => rest,
            _ => return Err(AhsError::Protocol(format!("no route for '{path}'"))),
        };

        let route = match rest {
            [] => Route::default(),
            [socket_url] => Route {
                socket_url: Some(socket_url.to_string()),
                ..Default::default()
            },
            [app, page, socket_url] => Route {
                app_name: Some(app.to_string()),
                page_name: Some(page.to_string()),
                socket_url: Some(socket_url.to_string()),
            },
            _ => return Err(AhsError::Protocol(format!("no route for '{path}'"))),
        };

        if let Some(url) = &route.socket_url {
            Uuid::parse_str(url)
                .map_err(|_| AhsError::Protocol(format!("socket url '{url}' is not a UUID")))?;
        }
        Ok(route)
    }
}

/// Everything known about one connection before the application runs.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub remote: Option<SocketAddr>,
    pub route: Route,
    pub identity: Identity,
    pub session: Option<Session>,
}

impl Scope {
    pub fn from_parts<'a>(
        path: &str,
        query: Option<&str>,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
        remote: Option<SocketAddr>,
    ) -> AhsResult<Self> {
        Ok(Self {
            path: path.to_string(),
            query: parse_query(query.unwrap_or("")),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            remote,
            route: Route::parse(path)?,
            identity: Identity::Anonymous,
            session: None,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then_some(v)
        })
    }

    /// Token from `Authorization: Bearer`, `?token=`, or the token cookie.
    pub fn credential(&self) -> Option<&str> {
        if let Some(auth) = self.header("authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                return Some(token.trim());
            }
        }
        if let Some(token) = self.query.get("token") {
            return Some(token);
        }
        self.cookie(TOKEN_COOKIE)
    }
}

/// Parse `a=1&b=2`. Percent-encoding is not decoded; tokens and UUIDs never
/// need it.
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0b0e6a4e-9a0f-4d52-9a57-6a1d55a3c111";

    #[test]
    fn full_route() {
        let route = Route::parse(&format!("/ws/bookmarks/home/{ID}/")).unwrap();
        assert_eq!(route.app_name.as_deref(), Some("bookmarks"));
        assert_eq!(route.page_name.as_deref(), Some("home"));
        assert_eq!(route.socket_url.as_deref(), Some(ID));
    }

    #[test]
    fn short_routes() {
        assert_eq!(Route::parse("/ws/").unwrap(), Route::default());
        let route = Route::parse(&format!("/ws/{ID}")).unwrap();
        assert_eq!(route.socket_url.as_deref(), Some(ID));
        assert_eq!(route.app_name, None);
    }

    #[test]
    fn bad_routes() {
        assert!(Route::parse("/api/x").is_err());
        assert!(Route::parse("/ws/bookmarks/home/not-a-uuid").is_err());
        assert!(Route::parse("/ws/a/b").is_err());
    }

    #[test]
    fn credential_sources_in_order() {
        let scope = Scope::from_parts(
            "/ws/",
            Some("token=from-query"),
            [
                ("Authorization", "Bearer from-header"),
                ("Cookie", "ahs_token=from-cookie"),
            ],
            None,
        )
        .unwrap();
        assert_eq!(scope.credential(), Some("from-header"));

        let scope = Scope::from_parts(
            "/ws/",
            Some("x=1&token=from-query"),
            [("Cookie", "ahs_token=from-cookie")],
            None,
        )
        .unwrap();
        assert_eq!(scope.credential(), Some("from-query"));

        let scope = Scope::from_parts(
            "/ws/",
            None,
            [("Cookie", "theme=dark; ahs_token=from-cookie; ahs_session=s")],
            None,
        )
        .unwrap();
        assert_eq!(scope.credential(), Some("from-cookie"));
        assert_eq!(scope.cookie(SESSION_COOKIE), Some("s"));

        let scope = Scope::from_parts("/ws/", None, Vec::<(&str, &str)>::new(), None).unwrap();
        assert_eq!(scope.credential(), None);
    }
}
