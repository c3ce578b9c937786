//! Test utilities and global setup
//!
//! Provides centralized test logging configuration and helpers for tests
//! that run a language server process.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, writes through the test writer and only
    /// initializes once per test binary.
    ///
    /// ```bash
    /// RUST_LOG=polyglot_lsp=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Global test logging setup
///
/// Add this to any test module where you want automatic logging initialization.
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Language servers scripted in `sh`
///
/// The script sees the client's framed messages on stdin and writes
/// framed replies with [`emit`].
#[cfg(test)]
pub mod scripted {
    use crate::config::{Language, SessionConfig};
    use std::path::Path;
    use std::time::Duration;

    /// Reply to the first request (`initialize`, id 1)
    pub const INITIALIZE_RESPONSE: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"capabilities":{"hoverProvider":true,"definitionProvider":true}}}"#;

    /// Shell command writing one framed message; `body` must not contain `'`
    pub fn emit(body: &str) -> String {
        format!(
            "printf 'Content-Length: {}\\r\\n\\r\\n%s' '{}'",
            body.len(),
            body
        )
    }

    /// Wait for the `initialize` request, answer it, then run `rest`
    pub fn handshake_then(rest: &str) -> String {
        format!("read -r _; {}; {}", emit(INITIALIZE_RESPONSE), rest)
    }

    pub fn config(root: &Path, script: &str) -> SessionConfig {
        SessionConfig::builder()
            .root(root)
            .language(Language::Python)
            .command("sh")
            .add_args(["-c", script])
            .initialization_timeout(Duration::from_secs(10))
            .request_timeout(Duration::from_secs(10))
            .shutdown_grace(Duration::from_millis(300))
            .build()
            .expect("scripted server config")
    }
}

/// Helpers for tests against a real jedi-language-server
#[cfg(all(test, feature = "server-integration-tests"))]
pub mod integration {
    use std::path::PathBuf;

    /// psf/black commit the fixture expectations were recorded against
    pub const BLACK_COMMIT: &str = "f3b50e466969f9142393ec32a4b2a383ffbe5f23";

    /// Checkout of psf/black at [`BLACK_COMMIT`], from `BLACK_REPO_PATH`
    pub fn black_repo_path() -> PathBuf {
        std::env::var("BLACK_REPO_PATH")
            .map(PathBuf::from)
            .expect("BLACK_REPO_PATH must point at a psf/black checkout")
    }

    /// Server command, from `JEDI_LANGUAGE_SERVER` or `PATH`
    pub fn jedi_command() -> String {
        std::env::var("JEDI_LANGUAGE_SERVER").unwrap_or_else(|_| "jedi-language-server".to_string())
    }
}
