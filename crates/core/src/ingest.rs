use crate::models::{Document, StorageLocation};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A file found under an ingestion folder, addressed relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDocument {
    pub id: String,
    pub filename: String,
    /// Forward-slash separated path below the folder; doubles as the object
    /// path inside the folder's storage bucket.
    pub relative_path: String,
    pub mime_type: &'static str,
    pub full_path: PathBuf,
}

impl DiscoveredDocument {
    pub fn into_document(self, bucket: &str, case_id: Option<&str>) -> Document {
        let document = Document::new(
            self.id,
            self.filename,
            StorageLocation {
                bucket: bucket.to_string(),
                path: self.relative_path,
            },
            self.mime_type,
        );
        match case_id {
            Some(case_id) => document.with_case(case_id),
            None => document,
        }
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        _ => return None,
    };
    Some(mime)
}

/// Recursively lists files with a known document type, sorted by path.
pub fn discover_documents(folder: &Path) -> Vec<DiscoveredDocument> {
    let mut documents = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(mime_type) = mime_for_path(entry.path()) else {
            continue;
        };
        let Ok(relative) = entry.path().strip_prefix(folder) else {
            continue;
        };

        let relative_path = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let filename = entry.file_name().to_string_lossy().to_string();

        documents.push(DiscoveredDocument {
            id: document_id(&relative_path),
            filename,
            relative_path,
            mime_type,
            full_path: entry.path().to_path_buf(),
        });
    }

    documents.sort_unstable_by(|left, right| left.relative_path.cmp(&right.relative_path));
    documents
}

fn document_id(relative_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(relative_path.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovery_is_recursive_sorted_and_filtered() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("processo");
        fs::create_dir(&nested)?;

        fs::write(base.join("b.pdf"), b"%PDF-1.4\n%fake")?;
        fs::write(nested.join("a.TXT"), b"texto")?;
        fs::write(base.join("scan.jpeg"), b"\xFF\xD8")?;
        fs::write(base.join("planilha.xlsx"), b"zip")?;

        let documents = discover_documents(base);
        let paths = documents
            .iter()
            .map(|document| document.relative_path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["b.pdf", "processo/a.TXT", "scan.jpeg"]);
        assert_eq!(documents[1].mime_type, "text/plain");
        assert_eq!(documents[1].filename, "a.TXT");
        assert_eq!(documents[2].mime_type, "image/jpeg");
        Ok(())
    }

    #[test]
    fn ids_depend_only_on_the_relative_path() -> Result<(), Box<dyn std::error::Error>> {
        let first = tempdir()?;
        let second = tempdir()?;
        fs::write(first.path().join("inicial.pdf"), b"one")?;
        fs::write(second.path().join("inicial.pdf"), b"two")?;

        let left = discover_documents(first.path());
        let right = discover_documents(second.path());
        assert_eq!(left[0].id, right[0].id);
        assert_eq!(left[0].id.len(), 64);
        Ok(())
    }

    #[test]
    fn discovered_file_becomes_a_pending_document() {
        let discovered = DiscoveredDocument {
            id: "abc".to_string(),
            filename: "inicial.pdf".to_string(),
            relative_path: "case/inicial.pdf".to_string(),
            mime_type: "application/pdf",
            full_path: PathBuf::from("/tmp/case/inicial.pdf"),
        };

        let document = discovered.into_document("documents", Some("case-7"));
        assert_eq!(document.location.bucket, "documents");
        assert_eq!(document.location.path, "case/inicial.pdf");
        assert_eq!(document.case_id.as_deref(), Some("case-7"));
        assert!(document.active);
    }

    #[test]
    fn empty_folder_yields_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        assert!(discover_documents(dir.path()).is_empty());
        Ok(())
    }
}
