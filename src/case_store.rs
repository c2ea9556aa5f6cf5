// Case transform lookup
// Stored DICOM-to-register matrices keyed by case identifier

use serde::Deserialize;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use tracing::debug;

use crate::error::CaseLookupError;

/// Fetches the stored 4x4 matrix of a case, as nested rows.
pub trait CaseLookup {
    fn fetch_transform(
        &self,
        case_id: &str,
    ) -> impl Future<Output = Result<Vec<Vec<f64>>, CaseLookupError>> + Send;
}

#[derive(Debug, Deserialize)]
struct CaseFile {
    matrix: Vec<Vec<f64>>,
}

/// Directory of `<case_id>.json` files, each holding `{"matrix": [[...], ...]}`.
#[derive(Debug, Clone)]
pub struct JsonCaseStore {
    dir: PathBuf,
}

impl JsonCaseStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonCaseStore { dir: dir.into() }
    }

    fn case_path(&self, case_id: &str) -> Option<PathBuf> {
        if case_id.is_empty() || case_id.contains(['/', '\\']) || case_id.contains("..") {
            return None;
        }
        Some(self.dir.join(format!("{case_id}.json")))
    }
}

impl CaseLookup for JsonCaseStore {
    async fn fetch_transform(&self, case_id: &str) -> Result<Vec<Vec<f64>>, CaseLookupError> {
        let path = self
            .case_path(case_id)
            .ok_or_else(|| CaseLookupError::NotFound(case_id.to_string()))?;
        debug!(path = %path.display(), "Reading case file");

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CaseLookupError::NotFound(case_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let case: CaseFile =
            serde_json::from_str(&contents).map_err(|e| CaseLookupError::Parse(e.to_string()))?;
        Ok(case.matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_case_matrix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("case-1.json"),
            r#"{"matrix": [[1,0,0,50],[0,1,0,-30],[0,0,1,10],[0,0,0,1]], "note": "ignored"}"#,
        )
        .unwrap();

        let store = JsonCaseStore::new(dir.path());
        let rows = store.fetch_transform("case-1").await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1], vec![0.0, 1.0, 0.0, -30.0]);
    }

    #[tokio::test]
    async fn test_missing_and_invalid_cases() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{\"matrix\": 7}").unwrap();
        let store = JsonCaseStore::new(dir.path());

        assert!(matches!(store.fetch_transform("absent").await, Err(CaseLookupError::NotFound(_))));
        assert!(matches!(store.fetch_transform("../etc").await, Err(CaseLookupError::NotFound(_))));
        assert!(matches!(store.fetch_transform("").await, Err(CaseLookupError::NotFound(_))));
        assert!(matches!(store.fetch_transform("broken").await, Err(CaseLookupError::Parse(_))));
    }
}
