use std::path::{Path, PathBuf};

use crate::{check_size, FetchError, FileOptions, Fetcher, Locator};

/// Local filesystem artifacts: bare paths and `file://` URLs.
pub struct FileFetcher {
    root: Option<PathBuf>,
}

impl FileFetcher {
    pub fn new(opts: &FileOptions) -> Self { Self { root: opts.root_dir.clone() } }

    fn path_for(&self, locator: &Locator) -> Result<PathBuf, FetchError> {
        let path = match locator.url() {
            Some(url) => url
                .to_file_path()
                .map_err(|_| FetchError::invalid(locator.as_str(), "file URL must be an absolute local path"))?,
            None => PathBuf::from(locator.as_str()),
        };
        Ok(match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        })
    }
}

#[async_trait::async_trait]
impl Fetcher for FileFetcher {
    fn name(&self) -> &'static str { "file" }

    fn provides(&self, scheme: &str) -> bool { scheme == "file" }

    async fn get(&self, locator: &Locator) -> Result<Vec<u8>, FetchError> {
        let path = self.path_for(locator)?;
        let meta = tokio::fs::metadata(&path).await.map_err(|e| unavailable(&path, e))?;
        if !meta.is_file() {
            return Err(unavailable(&path, "not a regular file"));
        }
        check_size(locator.as_str(), meta.len())?;
        tokio::fs::read(&path).await.map_err(|e| unavailable(&path, e))
    }
}

fn unavailable(path: &Path, reason: impl ToString) -> FetchError { FetchError::unavailable(path.display().to_string(), reason) }

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_bare_relative_and_file_url_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chart.tgz"), b"bytes").unwrap();

        let rooted = FileFetcher::new(&FileOptions { root_dir: Some(dir.path().to_path_buf()) });
        let got = rooted.get(&Locator::parse("chart.tgz").unwrap()).await.unwrap();
        assert_eq!(got, b"bytes");

        let plain = FileFetcher::new(&FileOptions::default());
        let abs = dir.path().join("chart.tgz");
        let got = plain.get(&Locator::parse(abs.to_str().unwrap()).unwrap()).await.unwrap();
        assert_eq!(got, b"bytes");
        let url = format!("file://{}", abs.display());
        let got = plain.get(&Locator::parse(&url).unwrap()).await.unwrap();
        assert_eq!(got, b"bytes");
    }

    #[tokio::test]
    async fn missing_files_and_directories_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let f = FileFetcher::new(&FileOptions { root_dir: Some(dir.path().to_path_buf()) });
        let err = f.get(&Locator::parse("nope.tgz").unwrap()).await.unwrap_err();
        assert!(matches!(err, FetchError::SourceUnavailable { .. }), "err={}", err);
        let err = f.get(&Locator::parse(dir.path().to_str().unwrap()).unwrap()).await.unwrap_err();
        assert!(err.to_string().contains("not a regular file"), "err={}", err);
    }
}
