//! Directory of VBF files sorted by download role

use std::path::Path;

use tracing::{info, warn};

use crate::error::{Result, VbfError};
use crate::file::VbfFile;
use crate::header::SwPartType;

/// Files needed for one software download.
#[derive(Debug, Clone, Default)]
pub struct VbfCatalog {
    pub sbl: Option<VbfFile>,
    pub ess: Vec<VbfFile>,
    /// Everything else (EXE, DATA, ...) in file-name order
    pub application: Vec<VbfFile>,
}

impl VbfCatalog {
    /// Load every `*.vbf` in `dir`, in file-name order
    pub fn scan(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_vbf = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("vbf"));
            if is_vbf && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut catalog = Self::default();
        for path in paths {
            catalog.add(VbfFile::load(&path)?)?;
        }

        info!(
            dir = %dir.display(),
            sbl = catalog.sbl.is_some(),
            ess = catalog.ess.len(),
            application = catalog.application.len(),
            "Scanned VBF directory"
        );
        Ok(catalog)
    }

    pub fn from_files(files: impl IntoIterator<Item = VbfFile>) -> Result<Self> {
        let mut catalog = Self::default();
        for file in files {
            catalog.add(file)?;
        }
        Ok(catalog)
    }

    fn add(&mut self, file: VbfFile) -> Result<()> {
        let part_type = file.header().sw_part_type.clone();
        match part_type {
            SwPartType::Sbl => {
                if let Some(existing) = &self.sbl {
                    return Err(VbfError::MalformedVbf(format!(
                        "more than one SBL: {} and {}",
                        existing.name(),
                        file.name()
                    )));
                }
                self.sbl = Some(file);
            }
            SwPartType::Ess => self.ess.push(file),
            SwPartType::Test | SwPartType::Other(_) => {
                warn!(file = %file.name(), %part_type, "Downloading file with unusual part type");
                self.application.push(file);
            }
            _ => self.application.push(file),
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.sbl.is_none() && self.ess.is_empty() && self.application.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::VbfBuilder;

    fn write(dir: &Path, name: &str, part_type: SwPartType) {
        let bytes = VbfBuilder::new(part_type).block(0x1000, vec![1, 2, 3]).build();
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn test_scan_classifies_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b_app.vbf", SwPartType::Exe);
        write(dir.path(), "a_sbl.VBF", SwPartType::Sbl);
        write(dir.path(), "c_data.vbf", SwPartType::Data);
        write(dir.path(), "d_ess.vbf", SwPartType::Ess);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = VbfCatalog::scan(dir.path()).unwrap();
        assert!(catalog.sbl.is_some());
        assert_eq!(catalog.ess.len(), 1);
        let parts: Vec<_> = catalog
            .application
            .iter()
            .map(|f| f.header().sw_part_type.clone())
            .collect();
        assert_eq!(parts, vec![SwPartType::Exe, SwPartType::Data]);
    }

    #[test]
    fn test_two_sbls_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sbl1.vbf", SwPartType::Sbl);
        write(dir.path(), "sbl2.vbf", SwPartType::Sbl);
        assert!(VbfCatalog::scan(dir.path()).is_err());
    }
}
