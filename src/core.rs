use std::sync::Arc;

/// Atomic reference-counted string type used for names and keys.
pub(crate) type ArcStr = Arc<str>;

/// Environment variable consulted by [`Environment::from_env`].
pub const MODE_VAR: &str = "TRACEBRIDGE_MODE";

/// The mode in which the hosting application is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Development mode, diagnostics such as trace pages are permitted.
    Dev,
    /// Production mode.
    #[default]
    Prod,
}

impl Mode {
    /// Parses a mode name, anything unrecognized is treated as production.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Mode::Dev,
            _ => Mode::Prod,
        }
    }
}

/// Host environment and configuration shared by the sensor and the renderer.
///
/// This plays the role the host framework's environment and HTTP
/// configuration play: it says whether the application runs in development
/// mode and under which path prefix it is mounted.
#[derive(Debug, Clone)]
pub struct Environment {
    /// The name of the application, shown on the trace page.
    pub application: &'static str,
    /// The current mode.
    pub mode: Mode,
    /// Path prefix the application is served under.
    pub context_path: String,
}

impl Environment {
    pub fn new(mode: Mode) -> Self {
        Self {
            application: "tracebridge",
            mode,
            context_path: String::from("/"),
        }
    }

    /// Reads the mode from the `TRACEBRIDGE_MODE` environment variable.
    pub fn from_env() -> Self {
        let mode = std::env::var(MODE_VAR)
            .map(|v| Mode::parse(&v))
            .unwrap_or_default();

        Self::new(mode)
    }

    pub fn with_context_path(mut self, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        self.context_path = path;
        self
    }

    pub fn is_dev(&self) -> bool {
        self.mode == Mode::Dev
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(Mode::default())
    }
}
