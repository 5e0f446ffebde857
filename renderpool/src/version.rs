//! Version information reported on the health endpoint.

/// renderpool version from Cargo.toml
pub const RENDERPOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub renderpool: &'static str,
    /// Script runtime version as printed by `<runtime> --version`, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            renderpool: RENDERPOOL_VERSION,
            runtime: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime(mut self, version: String) -> Self {
        self.runtime = Some(version);
        self
    }
}
