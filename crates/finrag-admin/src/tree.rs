//! Folder-grouped view of a bucket listing.

use std::collections::BTreeMap;

use finrag_bucket::{BucketError, BucketStore, ObjectMeta};

pub const ROOT_FOLDER: &str = "[ROOT]";

#[derive(Debug, Clone, PartialEq)]
pub struct TreeFile {
    pub name: String,
    pub size_mb: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderTotals {
    pub files: usize,
    pub size_mb: f64,
}

/// Files keyed by their folder (`a/b/` or [`ROOT_FOLDER`]). Folder markers are skipped.
#[derive(Debug, Default)]
pub struct BucketTree {
    pub folders: BTreeMap<String, Vec<TreeFile>>,
    /// Objects listed, folder markers included.
    pub objects: usize,
}

impl BucketTree {
    /// Lists at most `max_keys` objects under `prefix` and groups them.
    pub async fn list(
        store: &dyn BucketStore,
        prefix: &str,
        max_keys: usize,
    ) -> Result<Self, BucketError> {
        let objects = store.list_prefix_limited(prefix, max_keys).await?;
        Ok(Self::from_listing(&objects))
    }

    pub fn from_listing(objects: &[ObjectMeta]) -> Self {
        let mut folders: BTreeMap<String, Vec<TreeFile>> = BTreeMap::new();
        for object in objects {
            let (folder, name) = match object.key.rsplit_once('/') {
                Some((_, "")) => continue,
                Some((folder, name)) => (format!("{folder}/"), name),
                None => (ROOT_FOLDER.to_string(), object.key.as_str()),
            };
            folders.entry(folder).or_default().push(TreeFile {
                name: name.to_string(),
                size_mb: object.size_mb(),
            });
        }
        for files in folders.values_mut() {
            files.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Self {
            folders,
            objects: objects.len(),
        }
    }

    /// File counts and sizes per top-level folder.
    pub fn top_level_totals(&self) -> BTreeMap<String, FolderTotals> {
        let mut totals: BTreeMap<String, FolderTotals> = BTreeMap::new();
        for (folder, files) in &self.folders {
            let top = if folder == ROOT_FOLDER {
                ROOT_FOLDER
            } else {
                folder.split('/').next().unwrap_or(ROOT_FOLDER)
            };
            let entry = totals.entry(top.to_string()).or_default();
            entry.files += files.len();
            entry.size_mb += files.iter().map(|file| file.size_mb).sum::<f64>();
        }
        totals
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (folder, files) in &self.folders {
            let depth = if folder == ROOT_FOLDER {
                0
            } else {
                folder.matches('/').count()
            };
            let indent = "  ".repeat(depth.saturating_sub(1));
            out.push_str(&format!("{indent}{folder}\n"));
            for file in files {
                out.push_str(&format!(
                    "{indent}  {} ({})\n",
                    file.name,
                    format_size(file.size_mb)
                ));
            }
        }
        out
    }
}

pub fn format_size(size_mb: f64) -> String {
    if size_mb < 0.01 {
        format!("{:.2} KB", size_mb * 1024.0)
    } else {
        format!("{size_mb:.2} MB")
    }
}
