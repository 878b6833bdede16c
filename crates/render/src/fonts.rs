//! Font environment adapter
//!
//! Rasterizers that need to resolve non-embedded fonts get their font search
//! locations through this trait instead of reaching for process-global state.

use std::path::PathBuf;

pub trait FontEnvironment: Send + Sync {
    /// Directories searched for system fonts, most specific first
    fn font_dirs(&self) -> Vec<PathBuf>;

    /// Family substituted when a requested font cannot be found
    fn fallback_family(&self) -> &str {
        "Helvetica"
    }
}

/// Platform font directories
#[derive(Debug, Clone, Default)]
pub struct SystemFonts;

impl FontEnvironment for SystemFonts {
    fn font_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();

        if let Some(user) = dirs::font_dir() {
            dirs.push(user);
        }

        let system: &[&str] = if cfg!(target_os = "macos") {
            &["/Library/Fonts", "/System/Library/Fonts"]
        } else if cfg!(target_os = "windows") {
            &["C:\\Windows\\Fonts"]
        } else {
            &["/usr/local/share/fonts", "/usr/share/fonts"]
        };
        dirs.extend(system.iter().map(PathBuf::from));

        dirs
    }
}

/// No font lookup at all; only embedded fonts render
#[derive(Debug, Clone, Default)]
pub struct EmbeddedFontsOnly;

impl FontEnvironment for EmbeddedFontsOnly {
    fn font_dirs(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_fonts_lists_platform_dirs() {
        let dirs = SystemFonts.font_dirs();
        assert!(!dirs.is_empty());
        assert_eq!(SystemFonts.fallback_family(), "Helvetica");
    }

    #[test]
    fn test_embedded_only_has_no_dirs() {
        assert!(EmbeddedFontsOnly.font_dirs().is_empty());
    }
}
