//! Configuration system for language server sessions
//!
//! Provides [`SessionConfig`] with a builder that validates the workspace
//! root, the launch command and the timeouts, and the [`Language`] table
//! that maps languages to server commands and document language ids.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::ConfigError;
use crate::io::process::DEFAULT_GRACE_PERIOD;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default timeout for the `initialize` handshake (60 seconds)
///
/// Servers such as jedi or rust-analyzer may scan the workspace before
/// answering.
pub const DEFAULT_INITIALIZATION_TIMEOUT_SECS: u64 = 60;

/// Default timeout for individual LSP requests (30 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum allowed initialization timeout (5 minutes)
pub const MAX_INITIALIZATION_TIMEOUT_SECS: u64 = 300;

/// Environment variable overriding the server command in the CLI
pub const SERVER_COMMAND_ENV: &str = "POLYGLOT_LSP_SERVER";

// ============================================================================
// Languages
// ============================================================================

/// Languages with a known default server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Language {
    Python,
    Rust,
    Typescript,
    Javascript,
    Go,
    Cpp,
    Java,
}

impl Language {
    /// LSP language id for documents of this language
    pub fn language_id(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Rust => "rust",
            Language::Typescript => "typescript",
            Language::Javascript => "javascript",
            Language::Go => "go",
            Language::Cpp => "cpp",
            Language::Java => "java",
        }
    }

    /// Server command launched when none is configured
    pub fn default_command(self) -> (&'static str, &'static [&'static str]) {
        match self {
            Language::Python => ("jedi-language-server", &[]),
            Language::Rust => ("rust-analyzer", &[]),
            Language::Typescript | Language::Javascript => {
                ("typescript-language-server", &["--stdio"])
            }
            Language::Go => ("gopls", &[]),
            Language::Cpp => ("clangd", &[]),
            Language::Java => ("jdtls", &[]),
        }
    }

    /// File extensions owned by this language
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Language::Python => &["py", "pyi"],
            Language::Rust => &["rs"],
            Language::Typescript => &["ts", "tsx", "mts", "cts"],
            Language::Javascript => &["js", "jsx", "mjs", "cjs"],
            Language::Go => &["go"],
            Language::Cpp => &["cpp", "cc", "cxx", "c++", "hpp", "hh", "hxx", "h", "c"],
            Language::Java => &["java"],
        }
    }

    /// Find the language owning a file extension
    pub fn from_extension(extension: &str) -> Option<Self> {
        let extension = extension.to_ascii_lowercase();
        [
            Language::Python,
            Language::Rust,
            Language::Typescript,
            Language::Javascript,
            Language::Go,
            Language::Cpp,
            Language::Java,
        ]
        .into_iter()
        .find(|language| language.extensions().contains(&extension.as_str()))
    }

    /// Language of a file, by its extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|extension| extension.to_str())
            .and_then(Self::from_extension)
    }

    /// Language id for a specific document
    ///
    /// Refines the language id where one server handles several dialects
    /// (`.tsx`, `.jsx`, plain C).
    pub fn document_language_id(self, path: &Path) -> &'static str {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match (self, extension.as_str()) {
            (Language::Typescript, "tsx") => "typescriptreact",
            (Language::Javascript, "jsx") => "javascriptreact",
            (Language::Cpp, "c") => "c",
            _ => self.language_id(),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.language_id())
    }
}

// ============================================================================
// Document lifetime
// ============================================================================

/// How long documents opened implicitly by a query stay open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocumentPolicy {
    /// Stay open until closed explicitly or the session ends
    #[default]
    SessionScoped,
    /// Close documents a query had to open once the query finishes
    CloseAfterQuery,
}

// ============================================================================
// Core Configuration Types
// ============================================================================

/// Handler receiving the server's stderr, line by line
pub type StderrHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Complete language server session configuration
#[derive(Clone)]
pub struct SessionConfig {
    /// Canonical workspace root
    pub root: PathBuf,

    /// Workspace language
    pub language: Language,

    /// Server executable
    pub command: String,

    /// Server command-line arguments
    pub args: Vec<String>,

    /// Working directory for the server process
    pub working_directory: PathBuf,

    /// Timeout for individual requests
    pub request_timeout: Duration,

    /// Timeout for the `initialize` request
    pub initialization_timeout: Duration,

    /// Grace period for `shutdown`/`exit` and for process exit
    pub shutdown_grace: Duration,

    /// Lifetime of documents opened by queries
    pub document_policy: DocumentPolicy,

    /// `initializationOptions` sent with `initialize`
    pub initialization_options: Option<Value>,

    /// Client name for LSP identification
    pub client_name: String,

    /// Client version for LSP identification
    pub client_version: String,

    /// Optional stderr handler for process monitoring
    pub stderr_handler: Option<StderrHandler>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("root", &self.root)
            .field("language", &self.language)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_directory", &self.working_directory)
            .field("request_timeout", &self.request_timeout)
            .field("initialization_timeout", &self.initialization_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("document_policy", &self.document_policy)
            .field("initialization_options", &self.initialization_options)
            .field("client_name", &self.client_name)
            .field("client_version", &self.client_version)
            .field(
                "stderr_handler",
                &self.stderr_handler.as_ref().map(|_| "Fn(String)"),
            )
            .finish()
    }
}

impl SessionConfig {
    /// Start building a configuration
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for SessionConfig with validation and defaults
#[derive(Default)]
pub struct SessionConfigBuilder {
    root: Option<PathBuf>,
    language: Option<Language>,
    command: Option<String>,
    args: Option<Vec<String>>,
    working_directory: Option<PathBuf>,
    request_timeout: Option<Duration>,
    initialization_timeout: Option<Duration>,
    shutdown_grace: Option<Duration>,
    document_policy: DocumentPolicy,
    initialization_options: Option<Value>,
    client_name: Option<String>,
    client_version: Option<String>,
    stderr_handler: Option<StderrHandler>,
}

impl SessionConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the workspace root directory
    pub fn root(mut self, path: impl Into<PathBuf>) -> Self {
        self.root = Some(path.into());
        self
    }

    /// Set the workspace language
    pub fn language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    /// Override the server executable (default: the language's server)
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Add multiple server command-line arguments
    pub fn add_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args
            .get_or_insert_with(Vec::new)
            .extend(args.into_iter().map(|arg| arg.into()));
        self
    }

    /// Set the working directory for the server process (default: root)
    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    /// Set the request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the initialization timeout
    pub fn initialization_timeout(mut self, timeout: Duration) -> Self {
        self.initialization_timeout = Some(timeout);
        self
    }

    /// Set the shutdown grace period
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    /// Set the document lifetime policy
    pub fn document_policy(mut self, policy: DocumentPolicy) -> Self {
        self.document_policy = policy;
        self
    }

    /// Set the `initializationOptions` payload
    pub fn initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = Some(options);
        self
    }

    /// Set the LSP client name
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Set the LSP client version
    pub fn client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = Some(version.into());
        self
    }

    /// Set the stderr handler for process monitoring
    pub fn stderr_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let root = self
            .root
            .ok_or_else(|| ConfigError::missing_field("root"))?;
        let language = self
            .language
            .ok_or_else(|| ConfigError::missing_field("language"))?;

        let root = Self::validate_root(&root)?;

        // An explicit command without args does not inherit the default args
        let (command, args) = match self.command {
            Some(command) => (command, self.args.unwrap_or_default()),
            None => {
                let (command, default_args) = language.default_command();
                let args = self
                    .args
                    .unwrap_or_else(|| default_args.iter().map(|arg| arg.to_string()).collect());
                (command.to_string(), args)
            }
        };
        Self::validate_command(&command)?;

        let request_timeout = self
            .request_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));
        let initialization_timeout = self
            .initialization_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_INITIALIZATION_TIMEOUT_SECS));
        let shutdown_grace = self.shutdown_grace.unwrap_or(DEFAULT_GRACE_PERIOD);
        Self::validate_timeouts(request_timeout, initialization_timeout, shutdown_grace)?;

        Ok(SessionConfig {
            working_directory: self.working_directory.unwrap_or_else(|| root.clone()),
            root,
            language,
            command,
            args,
            request_timeout,
            initialization_timeout,
            shutdown_grace,
            document_policy: self.document_policy,
            initialization_options: self.initialization_options,
            client_name: self
                .client_name
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            client_version: self
                .client_version
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            stderr_handler: self.stderr_handler,
        })
    }

    /// Validate the root is an existing directory and canonicalize it
    fn validate_root(path: &Path) -> Result<PathBuf, ConfigError> {
        let canonical = path
            .canonicalize()
            .map_err(|source| ConfigError::RootValidation {
                root: path.to_path_buf(),
                source,
            })?;

        if !canonical.is_dir() {
            return Err(ConfigError::RootValidation {
                root: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "Workspace root is not a directory",
                ),
            });
        }

        Ok(canonical)
    }

    fn validate_command(command: &str) -> Result<(), ConfigError> {
        if command.trim().is_empty() {
            return Err(ConfigError::invalid_command(
                command,
                "Server command cannot be empty",
            ));
        }
        Ok(())
    }

    /// Validate timeout values are reasonable
    fn validate_timeouts(
        request_timeout: Duration,
        initialization_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Result<(), ConfigError> {
        if request_timeout.is_zero() {
            return Err(ConfigError::invalid_timeout(
                request_timeout,
                "Request timeout must be greater than zero",
            ));
        }

        if initialization_timeout.is_zero() {
            return Err(ConfigError::invalid_timeout(
                initialization_timeout,
                "Initialization timeout must be greater than zero",
            ));
        }

        if initialization_timeout > Duration::from_secs(MAX_INITIALIZATION_TIMEOUT_SECS) {
            return Err(ConfigError::invalid_timeout(
                initialization_timeout,
                format!(
                    "Initialization timeout cannot exceed {} seconds",
                    MAX_INITIALIZATION_TIMEOUT_SECS
                ),
            ));
        }

        if shutdown_grace.is_zero() {
            return Err(ConfigError::invalid_timeout(
                shutdown_grace,
                "Shutdown grace period must be greater than zero",
            ));
        }

        Ok(())
    }
}
