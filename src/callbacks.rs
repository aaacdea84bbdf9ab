//! User callbacks accepted by the driver.
//!
//! Every callback is optional and async. Construction goes through the
//! builder-style methods, which box the future so the driver stores plain
//! trait objects.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{StructuralMismatch, TransientError, ValidationFailure};
use crate::events::ProgressEvent;

pub type OnData = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, ()> + Send + Sync>;
pub type OnInvalidData = Arc<dyn Fn(ValidationFailure) -> BoxFuture<'static, ()> + Send + Sync>;
pub type OnStructuralError =
    Arc<dyn Fn(StructuralMismatch) -> BoxFuture<'static, bool> + Send + Sync>;
pub type OnTransientException =
    Arc<dyn Fn(TransientError) -> BoxFuture<'static, bool> + Send + Sync>;
pub type OnArchive = Arc<
    dyn Fn(Vec<u8>, String, Option<String>, PathBuf) -> BoxFuture<'static, anyhow::Result<PathBuf>>
        + Send
        + Sync,
>;
pub type OnRunStart = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
pub type OnRunComplete =
    Arc<dyn Fn(String, String, Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type OnProgress = Arc<dyn Fn(ProgressEvent) -> BoxFuture<'static, ()> + Send + Sync>;
pub type DuplicateCheck = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

/// The full callback set. `Default` is all-absent.
#[derive(Clone, Default)]
pub struct Callbacks {
    /// Invoked with each validated (or plain) result value.
    pub on_data: Option<OnData>,
    /// Invoked when deferred data fails validation. Absent: the validation
    /// error propagates and fails the run.
    pub on_invalid_data: Option<OnInvalidData>,
    /// Invoked on structural errors; return `true` to continue the run.
    /// Absent: the structural error propagates and fails the run.
    pub on_structural_error: Option<OnStructuralError>,
    /// Invoked before the retry machine on transient errors; return `false`
    /// to skip the request instead of retrying.
    pub on_transient_exception: Option<OnTransientException>,
    /// Transforms downloaded bytes into a local path. Absent: a default
    /// URL-derived filename under the storage dir.
    pub on_archive: Option<OnArchive>,
    pub on_run_start: Option<OnRunStart>,
    pub on_run_complete: Option<OnRunComplete>,
    pub on_progress: Option<OnProgress>,
    /// Extra user veto on dedup keys; return `false` to drop the enqueue.
    pub duplicate_check: Option<DuplicateCheck>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_data<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_data = Some(Arc::new(move |value| Box::pin(f(value))));
        self
    }

    pub fn on_invalid_data<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ValidationFailure) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_invalid_data = Some(Arc::new(move |failure| Box::pin(f(failure))));
        self
    }

    pub fn on_structural_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StructuralMismatch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.on_structural_error = Some(Arc::new(move |mismatch| Box::pin(f(mismatch))));
        self
    }

    pub fn on_transient_exception<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TransientError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.on_transient_exception = Some(Arc::new(move |err| Box::pin(f(err))));
        self
    }

    pub fn on_archive<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<u8>, String, Option<String>, PathBuf) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<PathBuf>> + Send + 'static,
    {
        self.on_archive = Some(Arc::new(move |content, url, expected_type, dir| {
            Box::pin(f(content, url, expected_type, dir))
        }));
        self
    }

    pub fn on_run_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_run_start = Some(Arc::new(move |name| Box::pin(f(name))));
        self
    }

    pub fn on_run_complete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, String, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_run_complete = Some(Arc::new(move |name, status, error| {
            Box::pin(f(name, status, error))
        }));
        self
    }

    pub fn on_progress<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ProgressEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_progress = Some(Arc::new(move |event| Box::pin(f(event))));
        self
    }

    pub fn duplicate_check<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.duplicate_check = Some(Arc::new(move |key| Box::pin(f(key))));
        self
    }
}

/// Default archive behavior: name the file after the last URL path segment,
/// falling back to a hash-derived name with an extension from the expected
/// type, and write it under the storage dir.
pub(crate) async fn default_archive(
    content: Vec<u8>,
    url: String,
    expected_type: Option<String>,
    storage_dir: PathBuf,
) -> anyhow::Result<PathBuf> {
    let filename = url::Url::parse(&url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_owned))
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| {
            let ext = match expected_type.as_deref() {
                Some("pdf") => ".pdf",
                Some("audio") => ".mp3",
                _ => "",
            };
            use sha2::{Digest, Sha256};
            let digest = hex::encode(Sha256::digest(url.as_bytes()));
            format!("download_{}{ext}", &digest[..16])
        });

    let path = storage_dir.join(filename);
    tokio::fs::write(&path, &content).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_archive_uses_url_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_archive(
            b"pdf bytes".to_vec(),
            "http://court.example/opinions/24-1.pdf".to_string(),
            Some("pdf".to_string()),
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();
        assert_eq!(path.file_name().unwrap(), "24-1.pdf");
        assert_eq!(std::fs::read(&path).unwrap(), b"pdf bytes");
    }

    #[tokio::test]
    async fn default_archive_generates_name_for_bare_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_archive(
            b"x".to_vec(),
            "http://court.example/".to_string(),
            Some("pdf".to_string()),
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("download_"));
        assert!(name.ends_with(".pdf"));
    }
}
