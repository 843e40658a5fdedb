use std::path::{Path, PathBuf};
use std::{env, fs, io};

use crate::credentials::API_KEY_FILE;

/// Directory layout rooted at the install location.
///
/// The tool is portable: prompts, workflows, and generated images all live
/// next to the executable.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base: PathBuf,
}

impl AppPaths {
    /// Root the layout at the executable's directory, falling back to the
    /// current working directory.
    pub fn discover() -> Self {
        let base = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self { base }
    }

    /// Root the layout at an explicit directory.
    pub fn at(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// System prompt files.
    pub fn prompts_dir(&self) -> PathBuf {
        self.base.join("prompts")
    }

    /// Saved workflow files.
    pub fn workflows_dir(&self) -> PathBuf {
        self.base.join("workflows")
    }

    /// Root for generated images, one subdirectory per workflow.
    pub fn output_dir(&self) -> PathBuf {
        self.base.join("img")
    }

    pub fn api_key_file(&self) -> PathBuf {
        self.base.join(API_KEY_FILE)
    }

    /// Create the prompts, workflows, and output directories if missing.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(self.prompts_dir())?;
        fs::create_dir_all(self.workflows_dir())?;
        fs::create_dir_all(self.output_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_rooted_at_base() {
        let paths = AppPaths::at("/opt/imgpipe");
        assert_eq!(paths.prompts_dir(), Path::new("/opt/imgpipe/prompts"));
        assert_eq!(paths.workflows_dir(), Path::new("/opt/imgpipe/workflows"));
        assert_eq!(paths.output_dir(), Path::new("/opt/imgpipe/img"));
        assert_eq!(paths.api_key_file(), Path::new("/opt/imgpipe/api_key.txt"));
    }

    #[test]
    fn test_ensure_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(dir.path());
        paths.ensure().unwrap();
        assert!(paths.prompts_dir().is_dir());
        assert!(paths.workflows_dir().is_dir());
        assert!(paths.output_dir().is_dir());
    }
}
