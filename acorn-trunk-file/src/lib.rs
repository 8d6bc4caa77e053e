//! One-file-per-id trunk. Saves are atomic (tmp + rename), tombstone files
//! are retained so versions resume and change export converges.
//!
//! Two processes may point at the same directory; per-id writes then race at
//! the filesystem level and the last rename wins. That is the documented
//! "same-host sync via shared directory" pattern: eventually consistent, no
//! history.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use acorn_core::{import_wins, AcornError, AcornResult, NutShell, Trunk, TrunkCaps};
use parking_lot::RwLock;

const BLOB_EXT: &str = "blob";

#[derive(Debug)]
pub struct FileTrunk {
    root: PathBuf,
    // Serializes writers within this process; cross-process writers race at
    // rename granularity by design.
    lock: RwLock<()>,
}

impl FileTrunk {
    pub fn open(root: impl Into<PathBuf>) -> AcornResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FileTrunk {
            root,
            lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.{BLOB_EXT}", sanitize_id(id)))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> AcornResult<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_shell(path: &Path) -> AcornResult<NutShell> {
        NutShell::from_bytes(&fs::read(path)?)
    }

    fn scan(&self) -> AcornResult<Vec<NutShell>> {
        let mut shells = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXT) {
                continue;
            }
            match Self::read_shell(&path) {
                Ok(shell) => shells.push(shell),
                Err(err) => {
                    tracing::warn!(?path, %err, "skipping unreadable blob");
                }
            }
        }
        Ok(shells)
    }
}

impl Trunk for FileTrunk {
    fn save(&self, shell: NutShell) -> AcornResult<()> {
        let _guard = self.lock.write();
        let path = self.blob_path(&shell.id);
        self.write_atomic(&path, &shell.to_bytes())
    }

    fn load(&self, id: &str) -> AcornResult<Option<NutShell>> {
        let _guard = self.lock.read();
        let path = self.blob_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_shell(&path).map(Some)
    }

    fn delete(&self, id: &str) -> AcornResult<()> {
        let _guard = self.lock.write();
        let path = self.blob_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AcornError::from(err)),
        }
    }

    fn load_all(&self) -> AcornResult<Vec<NutShell>> {
        let _guard = self.lock.read();
        Ok(self
            .scan()?
            .into_iter()
            .filter(|shell| !shell.deleted)
            .collect())
    }

    fn export_changes(&self) -> AcornResult<Vec<NutShell>> {
        let _guard = self.lock.read();
        self.scan()
    }

    fn import(&self, shells: Vec<NutShell>) -> AcornResult<()> {
        let _guard = self.lock.write();
        for shell in shells {
            let path = self.blob_path(&shell.id);
            let current = if path.exists() {
                Some(Self::read_shell(&path)?)
            } else {
                None
            };
            if import_wins(current.as_ref(), &shell) {
                self.write_atomic(&path, &shell.to_bytes())?;
            }
        }
        Ok(())
    }

    fn capabilities(&self) -> TrunkCaps {
        TrunkCaps {
            history: false,
            durable: true,
            async_io: false,
            sync_export: true,
        }
    }
}

/// Filesystem-safe file stem for an id. Alphanumerics, `-`, `_`, and `.` pass
/// through; everything else becomes `%XX`, keeping distinct ids distinct.
fn sanitize_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
