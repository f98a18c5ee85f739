use std::path::{Path, PathBuf};

use hangar_core::Source;
use sha2::{Digest, Sha256};

use crate::EvalError;

/// A loaded flight module: where it lives and what it hashes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Normalised reference, `file://` URL for local paths.
    pub reference: String,
    pub path: PathBuf,
    pub checksum: String,
    pub size: usize,
}

impl Module {
    /// Read the module at `reference` (a local path or `file://` URL) and hash it.
    pub async fn load(reference: &str) -> Result<Self, EvalError> {
        let path = local_path(reference)?;
        let path = tokio::fs::canonicalize(&path).await.map_err(|e| load_err(reference, e))?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| load_err(reference, e))?;
        if bytes.is_empty() {
            return Err(EvalError::Load { reference: reference.to_string(), message: "module is empty".into() });
        }
        Ok(Self {
            reference: format!("file://{}", path.display()),
            path,
            checksum: hex::encode(Sha256::digest(&bytes)),
            size: bytes.len(),
        })
    }

    pub fn source(&self) -> Source { Source { reference: self.reference.clone(), checksum: self.checksum.clone() } }
}

fn local_path(reference: &str) -> Result<PathBuf, EvalError> {
    match reference.split_once("://") {
        None => Ok(Path::new(reference).to_path_buf()),
        Some(("file", rest)) => Ok(PathBuf::from(rest)),
        Some((scheme, _)) => Err(EvalError::Load {
            reference: reference.to_string(),
            message: format!("unsupported scheme {:?}; only local modules can be loaded", scheme),
        }),
    }
}

fn load_err(reference: &str, e: std::io::Error) -> EvalError {
    EvalError::Load { reference: reference.to_string(), message: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_and_normalises_local_modules() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("flight.sh");
        std::fs::write(&p, b"abc").unwrap();

        let m = Module::load(p.to_str().unwrap()).await.unwrap();
        assert!(m.reference.starts_with("file:///"), "{}", m.reference);
        assert_eq!(m.checksum, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_eq!(m.size, 3);

        let again = Module::load(&m.reference).await.unwrap();
        assert_eq!(again, m);
    }

    #[tokio::test]
    async fn rejects_remote_and_missing_modules() {
        let err = Module::load("https://example.com/x.wasm").await.unwrap_err();
        assert!(matches!(err, EvalError::Load { .. }));
        assert!(err.to_string().contains("unsupported scheme"));

        let err = Module::load("/definitely/not/here").await.unwrap_err();
        assert!(matches!(err, EvalError::Load { .. }));
    }
}
