use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// A request-scoped temporary image. The file is removed when the value is dropped,
/// whichever way the request ends.
#[derive(Debug)]
pub struct TransientAsset {
    file: NamedTempFile,
}

impl TransientAsset {
    pub fn create(dir: &Path, prefix: &str, bytes: &[u8]) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".jpg")
            .tempfile_in(dir)
            .with_context(|| format!("create transient asset in {}", dir.display()))?;
        file.write_all(bytes).context("write transient asset")?;
        file.flush().context("flush transient asset")?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
