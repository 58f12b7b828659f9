use std::future::Future;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ReaderConfig;
use crate::readers::{ContainerKind, ReadError};

/// An uploaded file held in memory: its id (the file name), optional declared
/// kind, and contents.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub file_id: String,
    pub declared_kind: Option<ContainerKind>,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn from_bytes(file_id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_id: file_id.into(),
            declared_kind: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_kind(mut self, kind: ContainerKind) -> Self {
        self.declared_kind = Some(kind);
        self
    }

    pub fn kind(&self) -> Result<ContainerKind, ReadError> {
        ContainerKind::detect(self.declared_kind, &self.file_id, &self.bytes)
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::UnexpectedEof
    )
}

/// Run `op` until it succeeds, fails permanently, or `config.io_retries`
/// transient failures have been retried. The delay doubles after each retry.
async fn with_retries<T, F, Fut>(file_id: &str, config: &ReaderConfig, mut op: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut delay = Duration::from_millis(config.retry_backoff_ms);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                debug!(file_id, attempt, "Read source file");
                return Ok(value);
            }
            Err(e) if is_transient(e.kind()) && attempt < config.io_retries => {
                attempt += 1;
                warn!(file_id, attempt, error = %e, "Transient read failure, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read a file from disk, retrying transient failures with doubling backoff.
pub async fn read_source(path: &Path, config: &ReaderConfig) -> Result<SourceFile, ReadError> {
    let file_id = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let bytes = with_retries(&file_id, config, || tokio::fs::read(path))
        .await
        .map_err(|e| ReadError::CorruptContainer(format!("Cannot read {}: {e}", path.display())))?;
    if bytes.is_empty() {
        return Err(ReadError::EmptyInput);
    }
    Ok(SourceFile::from_bytes(file_id, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn reads_file_name_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jan.csv");
        std::fs::write(&path, b"date,amount\n2024-01-15,1\n").unwrap();

        let source = read_source(&path, &ReaderConfig::default()).await.unwrap();
        assert_eq!(source.file_id, "jan.csv");
        assert_eq!(source.kind().unwrap(), ContainerKind::Csv);
    }

    #[tokio::test]
    async fn empty_file_is_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            read_source(&path, &ReaderConfig::default()).await.unwrap_err(),
            ReadError::EmptyInput
        );
    }

    #[tokio::test]
    async fn missing_file_fails_without_retrying() {
        let config = ReaderConfig {
            retry_backoff_ms: 10_000,
            ..ReaderConfig::default()
        };
        let err = read_source(Path::new("/nonexistent/dir/x.csv"), &config).await.unwrap_err();
        assert!(matches!(err, ReadError::CorruptContainer(_)));
    }

    fn flaky(failures: u32, kind: ErrorKind) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<io::Result<u32>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < failures { Err(io::Error::from(kind)) } else { Ok(n) })
        };
        (calls, op)
    }

    fn quick(io_retries: u32) -> ReaderConfig {
        ReaderConfig {
            io_retries,
            retry_backoff_ms: 1,
            ..ReaderConfig::default()
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (calls, op) = flaky(2, ErrorKind::Interrupted);
        assert_eq!(with_retries("a.csv", &quick(3), op).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (calls, op) = flaky(10, ErrorKind::TimedOut);
        let err = with_retries("a.csv", &quick(2), op).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let (calls, op) = flaky(10, ErrorKind::PermissionDenied);
        assert!(with_retries("a.csv", &quick(3), op).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn declared_kind_overrides_detection() {
        let source = SourceFile::from_bytes("export.dat", b"a\tb\n".to_vec()).with_kind(ContainerKind::Txt);
        assert_eq!(source.kind().unwrap(), ContainerKind::Txt);
        assert!(SourceFile::from_bytes("export.dat", b"???".to_vec()).kind().is_err());
    }
}
