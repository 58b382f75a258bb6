//! Resolution of user-nominated file paths against the corpus.

use tracing::warn;

use reposcope_core::types::SourceDocument;

fn normalize(path: &str) -> String {
    let p = path.trim().replace('\\', "/");
    let p = p.trim_start_matches("./").trim_start_matches('/');
    p.to_string()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Resolves each requested path by exact match, then path suffix, then
/// basename. Among suffix matches the one closest in length wins. Unresolved
/// paths are logged and dropped; duplicates collapse.
pub fn resolve_targets<'a>(requested: &[String], documents: &'a [SourceDocument]) -> Vec<&'a SourceDocument> {
    let mut resolved: Vec<&SourceDocument> = Vec::new();
    for raw in requested {
        let want = normalize(raw);
        if want.is_empty() {
            continue;
        }
        let suffix = format!("/{want}");
        let hit = documents
            .iter()
            .find(|d| d.file_path == want)
            .or_else(|| {
                documents
                    .iter()
                    .filter(|d| d.file_path.ends_with(&suffix) || want.ends_with(&format!("/{}", d.file_path)))
                    .min_by_key(|d| (d.file_path.len().abs_diff(want.len()), d.file_path.clone()))
            })
            .or_else(|| documents.iter().find(|d| basename(&d.file_path) == basename(&want)));
        match hit {
            Some(doc) if !resolved.iter().any(|r| r.file_path == doc.file_path) => resolved.push(doc),
            Some(_) => {}
            None => warn!(path = %raw, "targeted file not found in corpus"),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_then_suffix_then_basename() {
        let docs = vec![
            SourceDocument::new("app/config.py", "a"),
            SourceDocument::new("config.py", "b"),
            SourceDocument::new("lib/auth/jwt.py", "c"),
        ];
        let got = |req: &[&str]| {
            let req: Vec<String> = req.iter().map(|s| s.to_string()).collect();
            resolve_targets(&req, &docs).iter().map(|d| d.file_path.clone()).collect::<Vec<_>>()
        };
        assert_eq!(got(&["config.py"]), vec!["config.py"]);
        assert_eq!(got(&["./auth/jwt.py"]), vec!["lib/auth/jwt.py"]);
        assert_eq!(got(&["/repo/src/app/config.py"]), vec!["app/config.py"]);
        assert_eq!(got(&["other/dir/jwt.py"]), vec!["lib/auth/jwt.py"]);
        assert_eq!(got(&["missing.rs", "config.py", "config.py"]), vec!["config.py"]);
    }
}
