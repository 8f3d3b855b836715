use std::fmt;

/// Build metadata reported by `blobprop version`.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub package: &'static str,
    pub version: &'static str,
    pub build_features: String,
}

impl BuildInfo {
    pub fn new(package: &'static str, version: &'static str) -> Self {
        Self {
            package,
            version,
            build_features: "none".to_string(),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (features: {})",
            self.package, self.version, self.build_features
        )
    }
}

/// Build info for the calling crate.
#[macro_export]
macro_rules! build_info {
    () => {
        $crate::version::BuildInfo::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    };
}
