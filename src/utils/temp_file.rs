use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// PEM bundle written to a temporary file for the TLS listener.
///
/// The file is removed when the value is dropped, or explicitly via [`CertificateFile::remove`].
#[derive(Debug)]
pub struct CertificateFile {
    file: NamedTempFile,
}

impl CertificateFile {
    pub fn write(data: &[u8]) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("hr-panel-")
            .suffix(".pem")
            .tempfile()?;
        file.write_all(data)?;
        file.flush()?;
        debug!(path = %file.path().display(), "certificate bundle written");
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn remove(self) {
        let path = self.file.path().to_path_buf();
        if let Err(e) = self.file.close() {
            warn!(path = %path.display(), error = %e, "failed to remove certificate file");
        } else {
            debug!(path = %path.display(), "certificate file removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certificate_file_written_and_removed() {
        let cert = CertificateFile::write(b"-----BEGIN CERTIFICATE-----\n").unwrap();
        let path = cert.path().to_path_buf();
        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"-----BEGIN CERTIFICATE-----\n"
        );
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("hr-panel-") && n.ends_with(".pem"))
            .unwrap_or(false));

        cert.remove();
        assert!(!path.exists());
    }

    #[test]
    fn test_certificate_file_removed_on_drop() {
        let path = {
            let cert = CertificateFile::write(b"pem").unwrap();
            cert.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
