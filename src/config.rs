use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::connection::ConnectionEvent;
use crate::error::{ServerError, ServerResult};

pub const DEFAULT_STATIC_EXTENSIONS: [&str; 6] = [".html", ".css", ".js", ".htm", ".sass", ".scss"];
pub const DEFAULT_SCRIPT_EXTENSIONS: [&str; 1] = [".php"];

/// Characters that may never appear in a whitelisted extension.
const EXTENSION_BLACKLIST: [char; 11] = [' ', '/', '<', '>', ';', '\'', '"', '\\', '?', '|', '*'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptConfig {
    pub interpreter_dir: PathBuf,
    pub interpreter_ini: PathBuf,
    pub interpreter_bin: String,
}

impl ScriptConfig {
    pub fn interpreter_path(&self) -> PathBuf {
        self.interpreter_dir.join(&self.interpreter_bin)
    }
}

/// Process-wide settings, fixed once the server is constructed.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Absolute and known to exist.
    pub docs_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Ordered; earlier entries win index probing.
    pub static_extensions: Vec<String>,
    /// Ordered; tried before `static_extensions` when scripts are enabled.
    pub script_extensions: Vec<String>,
    pub script: Option<ScriptConfig>,
    pub error_pages: HashMap<u16, PathBuf>,
    pub work_dir: PathBuf,
    pub sass_binary: PathBuf,
    pub read_buffer_size: usize,
    pub read_timeout_miliseconds: u64,
    pub no_delay: bool,
    pub enable_file_cache: bool,
    pub file_cache_threshold: usize,
    pub observer: Option<mpsc::Sender<ConnectionEvent>>,
}

impl ServerConfig {
    pub fn builder(docs_dir: impl Into<PathBuf>) -> ServerConfigBuilder {
        ServerConfigBuilder::new(docs_dir)
    }

    pub fn scripts_enabled(&self) -> bool {
        self.script.is_some()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn error_page(&self, status: u16) -> Option<&Path> {
        self.error_pages.get(&status).map(PathBuf::as_path)
    }

    pub fn is_static_extension(&self, ext: &str) -> bool {
        self.static_extensions.iter().any(|e| e == ext)
    }

    pub fn is_script_extension(&self, ext: &str) -> bool {
        self.scripts_enabled() && self.script_extensions.iter().any(|e| e == ext)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    docs_dir: PathBuf,
    host: String,
    port: u16,
    static_extensions: Vec<String>,
    script_extensions: Vec<String>,
    script: Option<ScriptConfig>,
    interpreter_bin: String,
    error_pages: HashMap<u16, PathBuf>,
    work_dir: PathBuf,
    sass_binary: PathBuf,
    read_buffer_size: usize,
    read_timeout_miliseconds: u64,
    no_delay: bool,
    enable_file_cache: bool,
    file_cache_threshold: usize,
    observer: Option<mpsc::Sender<ConnectionEvent>>,
}

impl ServerConfigBuilder {
    pub fn new(docs_dir: impl Into<PathBuf>) -> Self {
        Self {
            docs_dir: docs_dir.into(),
            host: "0.0.0.0".into(),
            port: 5055,
            static_extensions: DEFAULT_STATIC_EXTENSIONS.map(String::from).to_vec(),
            script_extensions: DEFAULT_SCRIPT_EXTENSIONS.map(String::from).to_vec(),
            script: None,
            interpreter_bin: "php-cgi".into(),
            error_pages: HashMap::from([(404, PathBuf::from("default/404.html"))]),
            work_dir: PathBuf::from("tmp"),
            sass_binary: PathBuf::from("interpreter/sass/sass"),
            read_buffer_size: 4096,
            read_timeout_miliseconds: 3000,
            no_delay: true,
            enable_file_cache: true,
            file_cache_threshold: 1024 * 1024,
            observer: None,
        }
    }

    pub fn docs_dir(&mut self, docs_dir: impl Into<PathBuf>) -> &mut Self {
        self.docs_dir = docs_dir.into();
        self
    }

    pub fn host(&mut self, host: impl Into<String>) -> &mut Self {
        self.host = host.into();
        self
    }

    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    pub fn work_dir(&mut self, work_dir: impl Into<PathBuf>) -> &mut Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn sass_binary(&mut self, sass_binary: impl Into<PathBuf>) -> &mut Self {
        self.sass_binary = sass_binary.into();
        self
    }

    pub fn read_buffer_size(&mut self, size: usize) -> &mut Self {
        self.read_buffer_size = size;
        self
    }

    pub fn read_timeout_miliseconds(&mut self, timeout: u64) -> &mut Self {
        self.read_timeout_miliseconds = timeout;
        self
    }

    pub fn no_delay(&mut self, no_delay: bool) -> &mut Self {
        self.no_delay = no_delay;
        self
    }

    pub fn file_cache(&mut self, enable: bool, threshold: usize) -> &mut Self {
        self.enable_file_cache = enable;
        self.file_cache_threshold = threshold;
        self
    }

    pub fn error_page(&mut self, status: u16, path: impl Into<PathBuf>) -> &mut Self {
        self.error_pages.insert(status, path.into());
        self
    }

    pub fn observer(&mut self, sender: mpsc::Sender<ConnectionEvent>) -> &mut Self {
        self.observer = Some(sender);
        self
    }

    pub fn whitelist_static_extension(&mut self, ext: &str) -> ServerResult<&mut Self> {
        validate_extension(ext)?;
        push_unique(&mut self.static_extensions, ext);
        Ok(self)
    }

    pub fn remove_static_extension(&mut self, ext: &str) -> &mut Self {
        self.static_extensions.retain(|e| e != ext);
        self
    }

    pub fn whitelist_script_extension(&mut self, ext: &str) -> ServerResult<&mut Self> {
        validate_extension(ext)?;
        push_unique(&mut self.script_extensions, ext);
        Ok(self)
    }

    pub fn remove_script_extension(&mut self, ext: &str) -> &mut Self {
        self.script_extensions.retain(|e| e != ext);
        self
    }

    /// Turns on the script bridge. The interpreter directory has to exist
    /// now; the ini file is only handed to the interpreter.
    pub fn enable_scripts(
        &mut self,
        interpreter_dir: impl AsRef<Path>,
        interpreter_ini: impl Into<PathBuf>,
    ) -> ServerResult<&mut Self> {
        let dir = interpreter_dir.as_ref();
        let dir = std::fs::canonicalize(dir)
            .map_err(|_| ServerError::InterpreterDirNotFound(dir.to_path_buf()))?;
        if !dir.is_dir() {
            return Err(ServerError::InterpreterDirNotFound(dir));
        }

        self.script = Some(ScriptConfig {
            interpreter_dir: dir,
            interpreter_ini: interpreter_ini.into(),
            interpreter_bin: self.interpreter_bin.clone(),
        });
        Ok(self)
    }

    /// Binary name inside the interpreter directory, `php-cgi` by default.
    /// Kept across `enable_scripts` and `disable_scripts`.
    pub fn interpreter_bin(&mut self, name: impl Into<String>) -> &mut Self {
        self.interpreter_bin = name.into();
        if let Some(script) = self.script.as_mut() {
            script.interpreter_bin = self.interpreter_bin.clone();
        }
        self
    }

    pub fn disable_scripts(&mut self) -> &mut Self {
        self.script = None;
        self
    }

    pub fn static_extensions(&self) -> &[String] {
        &self.static_extensions
    }

    pub fn script_extensions(&self) -> &[String] {
        &self.script_extensions
    }

    pub fn scripts_enabled(&self) -> bool {
        self.script.is_some()
    }

    /// Applies environment overrides, the same variables `serve` documents.
    #[cfg(feature = "env")]
    pub fn from_env(&mut self) -> ServerResult<&mut Self> {
        use std::env;

        if let Ok(data) = env::var("DOCS_DIR") {
            self.docs_dir = PathBuf::from(data);
        }

        if let Ok(data) = env::var("HOST") {
            self.host = data;
        }

        if let Ok(data) = env::var("PORT") {
            if let Ok(data) = data.parse::<u16>() {
                self.port = data;
            }
        }

        if let Ok(data) = env::var("READ_BUFFER_SIZE") {
            if let Ok(data) = data.parse::<usize>() {
                self.read_buffer_size = data;
            }
        }

        if let Ok(data) = env::var("READ_TIMEOUT_MILISECONDS") {
            if let Ok(data) = data.parse::<u64>() {
                self.read_timeout_miliseconds = data;
            }
        }

        if let Ok(data) = env::var("NO_DELAY") {
            // true, false
            if let Ok(data) = data.parse::<bool>() {
                self.no_delay = data;
            }
        }

        if let Ok(data) = env::var("ENABLE_FILE_CACHE") {
            if let Ok(data) = data.parse::<bool>() {
                self.enable_file_cache = data;
            }
        }

        if let Ok(data) = env::var("FILE_CACHE_THRESHOLD") {
            if let Ok(data) = data.parse::<usize>() {
                self.file_cache_threshold = data;
            }
        }

        if let Ok(data) = env::var("WORK_DIR") {
            self.work_dir = PathBuf::from(data);
        }

        if let Ok(data) = env::var("SASS_BINARY") {
            self.sass_binary = PathBuf::from(data);
        }

        if let Ok(dir) = env::var("PHP_DIR") {
            let ini = env::var("PHP_INI").unwrap_or_default();
            self.enable_scripts(dir, ini)?;
        }

        Ok(self)
    }

    /// Resolves the document root and freezes the settings.
    pub fn build(&self) -> ServerResult<ServerConfig> {
        let docs_dir = std::fs::canonicalize(&self.docs_dir)
            .map_err(|_| ServerError::InvalidDocsDir(self.docs_dir.clone()))?;
        if !docs_dir.is_dir() {
            return Err(ServerError::InvalidDocsDir(docs_dir));
        }

        Ok(ServerConfig {
            docs_dir,
            host: self.host.clone(),
            port: self.port,
            static_extensions: self.static_extensions.clone(),
            script_extensions: self.script_extensions.clone(),
            script: self.script.clone(),
            error_pages: self.error_pages.clone(),
            work_dir: self.work_dir.clone(),
            sass_binary: self.sass_binary.clone(),
            read_buffer_size: self.read_buffer_size,
            read_timeout_miliseconds: self.read_timeout_miliseconds,
            no_delay: self.no_delay,
            enable_file_cache: self.enable_file_cache,
            file_cache_threshold: self.file_cache_threshold,
            observer: self.observer.clone(),
        })
    }
}

fn validate_extension(ext: &str) -> ServerResult<()> {
    if ext.is_empty() || ext.contains(EXTENSION_BLACKLIST) {
        return Err(ServerError::InvalidFileExtension(ext.to_owned()));
    }
    Ok(())
}

fn push_unique(list: &mut Vec<String>, ext: &str) {
    if !list.iter().any(|e| e == ext) {
        list.push(ext.to_owned());
    }
}

/// On-disk form of the configuration, read by the `serve` binary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfigFile {
    pub docs_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub static_extensions: Option<Vec<String>>,
    pub script_extensions: Option<Vec<String>>,
    pub php_dir: Option<PathBuf>,
    pub php_ini: Option<PathBuf>,
    pub php_bin: Option<String>,
    pub error_pages: HashMap<u16, PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub sass_binary: Option<PathBuf>,
    pub read_buffer_size: Option<usize>,
    pub read_timeout_miliseconds: Option<u64>,
    pub no_delay: Option<bool>,
    pub enable_file_cache: Option<bool>,
    pub file_cache_threshold: Option<usize>,
}

impl ServerConfigFile {
    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Writes every field that is set onto `builder`. Extension lists replace
    /// the defaults wholesale and go through the same validation as
    /// individual whitelist calls. On error `builder` is left untouched.
    pub fn apply(&self, builder: &mut ServerConfigBuilder) -> ServerResult<()> {
        let mut next = builder.clone();
        if let Some(docs_dir) = &self.docs_dir {
            next.docs_dir(docs_dir);
        }
        if let Some(host) = &self.host {
            next.host(host);
        }
        if let Some(port) = self.port {
            next.port(port);
        }
        if let Some(extensions) = &self.static_extensions {
            replace_extensions(&mut next.static_extensions, extensions)?;
        }
        if let Some(extensions) = &self.script_extensions {
            replace_extensions(&mut next.script_extensions, extensions)?;
        }
        if let Some(bin) = &self.php_bin {
            next.interpreter_bin(bin);
        }
        if let Some(php_dir) = &self.php_dir {
            next.enable_scripts(php_dir, self.php_ini.clone().unwrap_or_default())?;
        }
        for (status, page) in &self.error_pages {
            next.error_page(*status, page);
        }
        if let Some(work_dir) = &self.work_dir {
            next.work_dir(work_dir);
        }
        if let Some(sass_binary) = &self.sass_binary {
            next.sass_binary(sass_binary);
        }
        if let Some(size) = self.read_buffer_size {
            next.read_buffer_size(size);
        }
        if let Some(timeout) = self.read_timeout_miliseconds {
            next.read_timeout_miliseconds(timeout);
        }
        if let Some(no_delay) = self.no_delay {
            next.no_delay(no_delay);
        }
        if self.enable_file_cache.is_some() || self.file_cache_threshold.is_some() {
            let enable = self.enable_file_cache.unwrap_or(next.enable_file_cache);
            let threshold = self.file_cache_threshold.unwrap_or(next.file_cache_threshold);
            next.file_cache(enable, threshold);
        }
        *builder = next;
        Ok(())
    }
}

/// Validates every entry before the list is touched.
fn replace_extensions(list: &mut Vec<String>, extensions: &[String]) -> ServerResult<()> {
    for ext in extensions {
        validate_extension(ext)?;
    }
    list.clear();
    for ext in extensions {
        push_unique(list, ext);
    }
    Ok(())
}
