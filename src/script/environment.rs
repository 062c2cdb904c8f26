use std::path::PathBuf;

use crate::config::ServerConfig;
use crate::helpers::traits::http_request::{decode_pairs, Request};
use crate::helpers::traits::http_response::SERVER_NAME;
use crate::resolver::ResolvedTarget;

pub type Pairs = Vec<(String, String)>;

/// Superglobals handed to one interpreter run.
///
/// Never mutated once built: the cookie-bearing rerun gets a fresh value
/// from [`ScriptEnvironment::with_cookies`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptEnvironment {
    /// `$_SERVER` scalars, including one `HTTP_*` entry per forwarded header.
    pub server: Pairs,
    pub get: Pairs,
    /// Present only for POST requests that carried a body.
    pub post: Option<Pairs>,
    pub cookie: Pairs,
    /// Raw `Cookie` value the cookie set was decoded from.
    pub cookie_header: Option<String>,
    pub script_path: PathBuf,
}

impl ScriptEnvironment {
    pub fn build(
        request: &Request,
        target: &ResolvedTarget,
        config: &ServerConfig,
        server_port: u16,
    ) -> Self {
        let received_at = request.received_at;
        let executable = std::env::current_exe()
            .map(|path| path.display().to_string())
            .unwrap_or_default();

        let mut server: Pairs = vec![
            ("QUERY_STRING".into(), request.query.clone()),
            ("REMOTE_ADDR".into(), request.client_addr.ip().to_string()),
            ("REMOTE_PORT".into(), request.client_addr.port().to_string()),
            ("DOCUMENT_ROOT".into(), config.docs_dir.display().to_string()),
            ("SCRIPT_FILENAME".into(), target.path.display().to_string()),
            ("REQUEST_METHOD".into(), request.method.to_string()),
            ("REQUEST_TIME".into(), received_at.timestamp().to_string()),
            (
                "REQUEST_TIME_FLOAT".into(),
                format!("{:.6}", received_at.timestamp_micros() as f64 / 1_000_000.0),
            ),
            ("REQUEST_URI".into(), request.uri.clone()),
            ("SERVER_PORT".into(), server_port.to_string()),
            ("SERVER_PROTOCOL".into(), format!("{:?}", request.version)),
            ("SERVER_SOFTWARE".into(), SERVER_NAME.into()),
            ("SERVER_EXECUTABLE".into(), executable),
            ("PHP_SELF".into(), target.location.clone()),
        ];

        let mut cookie_header = None;
        for (key, value) in request.headers.iter() {
            if key.eq_ignore_ascii_case("cookie") {
                cookie_header = Some(value.to_owned());
                continue;
            }
            server.push((cgi_header_name(key), value.to_owned()));
        }

        Self {
            server,
            get: decode_pairs(&request.query, '&'),
            post: request.post_body().map(|body| decode_pairs(&body, '&')),
            cookie: decode_cookies(cookie_header.as_deref()),
            cookie_header,
            script_path: target.path.clone(),
        }
    }

    /// New environment whose cookie set also holds `cookies`
    /// (`name=value` entries joined by `;`).
    pub fn with_cookies(&self, cookies: &str) -> Self {
        let cookie_header = match &self.cookie_header {
            Some(existing) if !existing.trim().is_empty() => format!("{}; {}", existing, cookies),
            _ => cookies.to_owned(),
        };
        Self {
            cookie: decode_cookies(Some(&cookie_header)),
            cookie_header: Some(cookie_header),
            ..self.clone()
        }
    }

    pub fn server_var(&self, key: &str) -> Option<&str> {
        lookup(&self.server, key)
    }

    pub fn get_var(&self, key: &str) -> Option<&str> {
        lookup(&self.get, key)
    }

    pub fn cookie_var(&self, key: &str) -> Option<&str> {
        lookup(&self.cookie, key)
    }

    /// Renders the environment as a PHP prelude that ends by including the
    /// target script.
    pub fn to_php(&self) -> String {
        let mut lines = vec![String::from("<?php")];
        lines.extend(self.server.iter().map(|(key, value)| {
            format!("$_SERVER['{}'] = '{}';", php_escape(key), php_escape(value))
        }));
        lines.push(format!("$_GET = {};", php_array(&self.get)));
        lines.push(format!(
            "$_POST = {};",
            php_array(self.post.as_deref().unwrap_or_default())
        ));
        lines.push(format!("$_COOKIE = {};", php_array(&self.cookie)));
        lines.push(format!(
            "include '{}';",
            php_escape(&self.script_path.display().to_string())
        ));
        lines.push(String::new());
        lines.join("\n")
    }
}

fn lookup<'a>(pairs: &'a Pairs, key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn decode_cookies(header: Option<&str>) -> Pairs {
    header
        .map(|header| decode_pairs(header, ';'))
        .unwrap_or_default()
}

/// `User-Agent` becomes `HTTP_USER_AGENT`.
fn cgi_header_name(key: &str) -> String {
    format!("HTTP_{}", key.to_ascii_uppercase().replace('-', "_"))
}

fn php_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn php_array(pairs: &[(String, String)]) -> String {
    let entries = pairs
        .iter()
        .map(|(k, v)| format!("'{}' => '{}'", php_escape(k), php_escape(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("array({})", entries)
}
