use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use http::StatusCode;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ScriptConfig;
use crate::error::ServerResult;
use crate::helpers::traits::bytes::find_subslice;
use crate::helpers::traits::http_request::header_lines;
use crate::helpers::traits::http_response::Response;
use crate::script::environment::ScriptEnvironment;

/// Runs one script invocation and returns whatever it printed.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, env: &ScriptEnvironment) -> ServerResult<Vec<u8>>;
}

/// Runs scripts through the configured CGI interpreter binary.
#[derive(Debug, Clone)]
pub struct InterpreterRunner {
    script: ScriptConfig,
    work_dir: PathBuf,
}

impl InterpreterRunner {
    pub fn new(script: ScriptConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            script,
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl ScriptRunner for InterpreterRunner {
    async fn run(&self, env: &ScriptEnvironment) -> ServerResult<Vec<u8>> {
        let work_file = WorkFile::create(&self.work_dir, env.to_php()).await?;
        let program = self.script.interpreter_path();

        let mut command = Command::new(&program);
        if !self.script.interpreter_ini.as_os_str().is_empty() {
            command.arg("-c").arg(&self.script.interpreter_ini);
        }
        command
            .arg(work_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        debug!(?program, file = ?work_file.path(), "running interpreter");
        let output = command.output().await?;
        if !output.status.success() {
            warn!(?program, status = %output.status, "interpreter exited unsuccessfully");
        }
        Ok(output.stdout)
    }
}

/// Prelude file for a single run, removed again on drop.
#[derive(Debug)]
struct WorkFile {
    path: PathBuf,
}

impl WorkFile {
    async fn create(dir: &Path, contents: String) -> ServerResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.php", Uuid::new_v4().simple()));
        tokio::fs::write(&path, contents).await?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = ?self.path, error = %e, "work file already gone");
        }
    }
}

/// Interpreter output split into CGI headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ScriptOutput {
    /// Splits on the first blank line. An empty header block leaves just the
    /// body after it. Output without a blank line, or whose first block is
    /// not made of `Key: value` lines, is all body.
    pub fn parse(raw: &[u8]) -> Self {
        let split = find_subslice(raw, b"\r\n\r\n")
            .map(|pos| (pos, 4))
            .or_else(|| find_subslice(raw, b"\n\n").map(|pos| (pos, 2)));

        let Some((pos, separator)) = split else {
            return Self::body_only(raw);
        };
        let body = &raw[pos + separator..];
        let head = String::from_utf8_lossy(&raw[..pos]);
        let lines: Vec<&str> = head.lines().collect();
        if lines.is_empty() {
            return Self::body_only(body);
        }
        if lines.iter().any(|line| !line.contains(':')) {
            return Self::body_only(raw);
        }

        Self {
            headers: header_lines(lines)
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            body: body.to_vec(),
        }
    }

    fn body_only(raw: &[u8]) -> Self {
        Self {
            headers: Vec::new(),
            body: raw.to_vec(),
        }
    }

    /// `name=value` of every `Set-Cookie` header, attributes dropped.
    pub fn set_cookies(&self) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, v)| v.split(';').next().unwrap_or_default().trim())
            .filter(|pair| !pair.is_empty())
            .collect()
    }
}

/// Runs the script and turns its output into a response.
///
/// A script that sets cookies is run a second time with those cookies added
/// to its cookie set, so it can read back what it just set. The client gets
/// the headers of the first run and the body of the second.
pub async fn execute<R>(runner: &R, env: &ScriptEnvironment) -> ServerResult<Response>
where
    R: ScriptRunner + ?Sized,
{
    let first = ScriptOutput::parse(&runner.run(env).await?);

    let cookies = first.set_cookies();
    let body = if cookies.is_empty() {
        first.body.clone()
    } else {
        let cookies = cookies.join(";");
        debug!(%cookies, "script set cookies, running again");
        let rerun = env.with_cookies(&cookies);
        ScriptOutput::parse(&runner.run(&rerun).await?).body
    };

    Ok(build_response(first.headers, body))
}

fn build_response(headers: Vec<(String, String)>, body: Vec<u8>) -> Response {
    let mut response = Response::new(StatusCode::OK).body(body);
    for (key, value) in headers {
        if key.eq_ignore_ascii_case("status") {
            apply_status(&mut response, &value);
        } else {
            response.headers.push((key, value));
        }
    }
    if response.get_header("content-type").is_none() {
        response.headers.push(("Content-Type".into(), "text/html".into()));
    }
    response
}

/// `Status: 404 Not Found` sets the code and keeps the script's wording.
fn apply_status(response: &mut Response, value: &str) {
    let value = value.trim();
    let (code, reason) = value.split_once(' ').unwrap_or((value, ""));
    match code.parse::<u16>().ok().and_then(|code| StatusCode::from_u16(code).ok()) {
        Some(status) => {
            response.status = status;
            response.status_text = match reason.trim().is_empty() {
                true => None,
                false => Some(value.to_owned()),
            };
        }
        None => {
            warn!(status = value, "script sent an unparseable status");
            response.status_text = Some(value.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::ServerConfig;
    use crate::helpers::traits::http_request::parse_request;
    use crate::resolver::{Mode, ResolvedTarget};

    /// Answers each run from a closure and records the environments seen.
    struct FakeRunner<F> {
        respond: F,
        seen: Mutex<Vec<ScriptEnvironment>>,
    }

    impl<F> FakeRunner<F>
    where
        F: Fn(&ScriptEnvironment, usize) -> Vec<u8> + Send + Sync,
    {
        fn new(respond: F) -> Self {
            Self {
                respond,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl<F> ScriptRunner for FakeRunner<F>
    where
        F: Fn(&ScriptEnvironment, usize) -> Vec<u8> + Send + Sync,
    {
        async fn run(&self, env: &ScriptEnvironment) -> ServerResult<Vec<u8>> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(env.clone());
            Ok((self.respond)(env, seen.len()))
        }
    }

    fn env(raw: &[u8]) -> ScriptEnvironment {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::builder(dir.path()).build().unwrap();
        let request = parse_request(raw, "127.0.0.1:40000".parse().unwrap()).unwrap();
        let target = ResolvedTarget {
            location: "/login.php".into(),
            path: config.docs_dir.join("login.php"),
            mode: Mode::Script,
        };
        ScriptEnvironment::build(&request, &target, &config, 5055)
    }

    #[test]
    fn parses_cgi_output() {
        let output = ScriptOutput::parse(
            b"X-Powered-By: PHP/8.3\r\nContent-type: text/html; charset=UTF-8\r\n\r\n<p>a</p>\r\n\r\n<p>b</p>",
        );
        assert_eq!(
            output.headers,
            vec![
                ("X-Powered-By".to_owned(), "PHP/8.3".to_owned()),
                ("Content-type".to_owned(), "text/html; charset=UTF-8".to_owned()),
            ]
        );
        assert_eq!(output.body, b"<p>a</p>\r\n\r\n<p>b</p>");
    }

    #[test]
    fn output_without_headers_is_body() {
        assert_eq!(ScriptOutput::parse(b"plain text").body, b"plain text");
        let output = ScriptOutput::parse(b"first paragraph\n\nsecond");
        assert!(output.headers.is_empty());
        assert_eq!(output.body, b"first paragraph\n\nsecond");
    }

    #[test]
    fn empty_header_block_leaves_body() {
        let output = ScriptOutput::parse(b"\r\n\r\ndone");
        assert!(output.headers.is_empty());
        assert_eq!(output.body, b"done");

        let output = ScriptOutput::parse(b"\n\n<p>hi</p>");
        assert_eq!(output.body, b"<p>hi</p>");
    }

    #[test]
    fn set_cookie_pairs_drop_attributes() {
        let output = ScriptOutput::parse(
            b"Set-Cookie: sid=abc123; Path=/\r\nSet-Cookie: lang=en\r\nX-A: 1\r\n\r\n",
        );
        assert_eq!(output.set_cookies(), vec!["sid=abc123", "lang=en"]);
    }

    #[tokio::test]
    async fn single_run_without_cookies() {
        let runner = FakeRunner::new(|_, _| b"Content-type: text/plain\r\n\r\nhello".to_vec());
        let response = execute(&runner, &env(b"GET /login.php HTTP/1.0\r\n\r\n"))
            .await
            .unwrap();

        assert_eq!(runner.seen.lock().unwrap().len(), 1);
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.get_header("content-type"), Some("text/plain"));
        assert_eq!(response.body.as_bytes(), b"hello");
    }

    #[tokio::test]
    async fn set_cookie_triggers_second_run() {
        let runner = FakeRunner::new(|env, run| match run {
            1 => b"Set-Cookie: sid=abc123; Path=/\r\n\r\nfirst".to_vec(),
            _ => format!(
                "Content-type: text/html\r\n\r\nsecond sid={}",
                env.cookie_var("sid").unwrap_or("none")
            )
            .into_bytes(),
        });
        let response = execute(&runner, &env(b"GET /login.php HTTP/1.0\r\n\r\n"))
            .await
            .unwrap();

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].cookie.is_empty());
        assert_eq!(
            seen[1].cookie,
            vec![("sid".to_owned(), "abc123".to_owned())]
        );

        assert_eq!(response.body.as_bytes(), b"second sid=abc123");
        assert_eq!(response.get_header("set-cookie"), Some("sid=abc123; Path=/"));
        assert_eq!(response.get_header("content-type"), Some("text/html"));
    }

    #[tokio::test]
    async fn cookies_merge_with_request_cookies() {
        let runner = FakeRunner::new(|_, run| match run {
            1 => b"Set-Cookie: a=1\r\nSet-Cookie: b=2; HttpOnly\r\n\r\n".to_vec(),
            _ => b"\r\n\r\ndone".to_vec(),
        });
        let env = env(b"GET /login.php HTTP/1.0\r\nCookie: theme=dark\r\n\r\n");
        let response = execute(&runner, &env).await.unwrap();
        assert_eq!(response.body.as_bytes(), b"done");

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[1].cookie_header.as_deref(), Some("theme=dark; a=1;b=2"));
        assert_eq!(seen[1].cookie_var("theme"), Some("dark"));
        assert_eq!(seen[1].cookie_var("b"), Some("2"));
    }

    #[tokio::test]
    async fn status_header_sets_status_line() {
        let runner = FakeRunner::new(|_, _| b"Status: 404 Not Found\r\n\r\nmissing".to_vec());
        let response = execute(&runner, &env(b"GET /login.php HTTP/1.0\r\n\r\n"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.status_line(), "HTTP/1.0 404 Not Found\r\n");
        assert_eq!(response.get_header("status"), None);
        assert_eq!(response.get_header("content-type"), Some("text/html"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interpreter_runs_unique_work_files() {
        use std::os::unix::fs::PermissionsExt;

        let interpreter = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let bin = interpreter.path().join("php-cgi");
        std::fs::write(&bin, "#!/bin/sh\nprintf 'Content-type: text/plain\\r\\n\\r\\n'\necho \"$1 $2 $3\"\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = InterpreterRunner::new(
            ScriptConfig {
                interpreter_dir: interpreter.path().to_path_buf(),
                interpreter_ini: PathBuf::from("php.ini"),
                interpreter_bin: "php-cgi".into(),
            },
            work.path(),
        );
        let env = env(b"GET /login.php HTTP/1.0\r\n\r\n");

        let first = ScriptOutput::parse(&runner.run(&env).await.unwrap());
        let second = ScriptOutput::parse(&runner.run(&env).await.unwrap());
        let first = String::from_utf8(first.body).unwrap();
        let second = String::from_utf8(second.body).unwrap();

        assert!(first.starts_with("-c php.ini "));
        assert!(first.trim_end().ends_with(".php"));
        assert_ne!(first, second);
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }
}
