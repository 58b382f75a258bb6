//! Corpus providers: a filesystem walker and an in-memory corpus.

use std::fs;
use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::traits::CorpusProvider;
use crate::types::SourceDocument;

/// Directory names never descended into (compared case-insensitively).
pub const SKIP_DIRS: &[&str] = &[
    ".git", "node_modules", "target", "dist", "build", "vendor", "__pycache__", ".venv", "venv", ".idea",
    ".vscode", ".cache", "bin", "obj",
];

const INDEXABLE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "go", "java", "c", "cpp", "h", "hpp", "cs", "rb", "php", "rs", "swift", "kt",
    "m", "mm", "sh", "bat", "md", "txt", "log", "json", "yaml", "yml", "toml", "env", "ini", "cfg", "conf", "csv",
    "xml", "rst", "sql", "html", "css",
];

/// Well-known file names indexed regardless of extension (compared case-insensitively).
const INDEXABLE_NAMES: &[&str] = &[
    "dockerfile", "makefile", "readme", "license", "changelog", "contributing", "authors", "gemfile", "rakefile",
    "procfile", "jenkinsfile", ".gitignore", ".dockerignore",
];

pub fn is_indexable(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else { return false };
    if INDEXABLE_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| INDEXABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Patterns from the corpus root's `.gitignore`; empty when there is none.
fn root_gitignore(root: &Path) -> Gitignore {
    let path = root.join(".gitignore");
    if !path.is_file() {
        return Gitignore::empty();
    }
    let mut builder = GitignoreBuilder::new(root);
    if let Some(e) = builder.add(&path) {
        warn!(path = %path.display(), error = %e, "some .gitignore lines were not understood");
    }
    match builder.build() {
        Ok(gitignore) => gitignore,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unusable .gitignore");
            Gitignore::empty()
        }
    }
}

fn is_skipped_dir(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SKIP_DIRS.contains(&lower.as_str())
}

/// Lists indexable files under `root` as `(relative path, absolute path)`, sorted
/// by relative path. Files larger than `max_file_bytes` or matched by the root
/// `.gitignore` are left out.
pub fn list_source_files(root: &Path, max_file_bytes: u64) -> Vec<(String, PathBuf)> {
    let gitignore = root_gitignore(root);
    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
        if e.depth() == 0 {
            return true;
        }
        let is_dir = e.file_type().is_dir();
        if is_dir && e.file_name().to_str().is_some_and(is_skipped_dir) {
            return false;
        }
        !gitignore.matched(e.path(), is_dir).is_ignore()
    });

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_indexable(entry.path()) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) if meta.len() > max_file_bytes => {
                debug!(path = %entry.path().display(), bytes = meta.len(), "skipping large file");
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "skipping file without metadata");
                continue;
            }
        }
        let Ok(rel) = entry.path().strip_prefix(root) else { continue };
        let rel = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
        files.push((rel, entry.path().to_path_buf()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
}

/// Corpus backed by a directory on disk.
#[derive(Debug, Clone)]
pub struct FsCorpus {
    root: PathBuf,
    max_file_bytes: u64,
}

impl FsCorpus {
    pub fn new(root: impl Into<PathBuf>, max_file_bytes: u64) -> Self {
        Self { root: root.into(), max_file_bytes }
    }
}

impl CorpusProvider for FsCorpus {
    fn documents(&self) -> Result<Vec<SourceDocument>> {
        if !self.root.is_dir() {
            return Err(Error::CorpusUnreadable(format!("{} is not a readable directory", self.root.display())));
        }
        fs::read_dir(&self.root)
            .map_err(|e| Error::CorpusUnreadable(format!("{}: {e}", self.root.display())))?;

        let mut documents = Vec::new();
        for (rel, abs) in list_source_files(&self.root, self.max_file_bytes) {
            let bytes = match fs::read(&abs) {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %rel, error = %e, "skipping unreadable file");
                    continue;
                }
            };
            if bytes.contains(&0) {
                debug!(path = %rel, "skipping binary file");
                continue;
            }
            match String::from_utf8(bytes) {
                Ok(content) => documents.push(SourceDocument::new(rel, content)),
                Err(_) => warn!(path = %rel, "skipping non-UTF-8 file"),
            }
        }

        if documents.is_empty() {
            return Err(Error::CorpusUnreadable(format!("no readable source files under {}", self.root.display())));
        }
        info!(root = %self.root.display(), files = documents.len(), "corpus loaded");
        Ok(documents)
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Corpus held in memory, optionally mirroring a directory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCorpus {
    documents: Vec<SourceDocument>,
    root: Option<PathBuf>,
}

impl MemoryCorpus {
    pub fn new(documents: Vec<SourceDocument>) -> Self {
        Self { documents, root: None }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }
}

impl CorpusProvider for MemoryCorpus {
    fn documents(&self) -> Result<Vec<SourceDocument>> {
        if self.documents.is_empty() {
            return Err(Error::CorpusUnreadable("empty in-memory corpus".to_string()));
        }
        let mut docs = self.documents.clone();
        docs.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(docs)
    }

    fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn describe(&self) -> String {
        format!("memory ({} documents)", self.documents.len())
    }
}
