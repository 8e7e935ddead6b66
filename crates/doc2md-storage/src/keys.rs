//! Pure key/URL helpers: output-key derivation, S3 URL parsing, and the
//! Content-Type table.
//!
//! Everything here is deterministic string work; the same inputs must always
//! yield byte-identical keys because retries and crash recovery re-derive
//! them.

use std::path::Path;

use doc2md_core::TaskType;

/// Source-side facts an output key is derived from.
#[derive(Debug, Clone, Default)]
pub struct OutputKeySource<'a> {
    /// Bucket the input object came from.
    pub bucket: Option<&'a str>,
    /// Object key of the input.
    pub key: Option<&'a str>,
    /// Free-form platform tag; stands in for the bucket on local-path tasks.
    pub platform: Option<&'a str>,
    /// Caller-supplied local input path.
    pub input_path: Option<&'a str>,
}

/// Derive the object-store prefix a task's artifacts land under:
///
/// ```text
/// {bucket_src}/{folder}/{stem(original_filename)}/{type_dir}
/// ```
///
/// When the input already lives in the output bucket under a `/pdf/` or
/// `/markdown/` tree (a previous conversion's artifact being converted
/// again), the real source bucket and stem are recovered from the key so
/// outputs do not nest inside outputs. Tasks with no usable source metadata
/// fall back to `converted/{task_id}`.
pub fn derive_output_prefix(
    source: &OutputKeySource<'_>,
    task_type: TaskType,
    task_id: i64,
    output_bucket: &str,
) -> String {
    let type_dir = task_type.type_dir();

    if let (Some(bucket), Some(key)) = (source.bucket, source.key) {
        if bucket == output_bucket && (key.contains("/pdf/") || key.contains("/markdown/")) {
            let parts: Vec<&str> = key.split('/').collect();
            if parts.len() >= 4 && (parts[2] == "pdf" || parts[2] == "markdown") {
                // Key shape is {real_bucket}/{stem}/{pdf|markdown}/{file}
                return join_segments(&[parts[0], parts[1], type_dir]);
            }
        }

        let (folder, filename) = split_key(key);
        let stem = file_stem(filename);
        return join_segments(&[bucket, folder, stem, type_dir]);
    }

    if let (Some(platform), Some(input_path)) = (source.platform, source.input_path) {
        let stem = file_stem(basename(input_path));
        if !stem.is_empty() {
            return join_segments(&[platform, stem, type_dir]);
        }
    }

    format!("converted/{}", task_id)
}

/// Full derived key for a single output artifact.
pub fn derive_output_key(
    source: &OutputKeySource<'_>,
    task_type: TaskType,
    task_id: i64,
    output_bucket: &str,
    final_filename: &str,
) -> String {
    let prefix = derive_output_prefix(source, task_type, task_id, output_bucket);
    format!("{}/{}", prefix, final_filename)
}

fn join_segments(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Split an object key into (folder, filename). The folder may be empty.
fn split_key(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(idx) => (&key[..idx], &key[idx + 1..]),
        None => ("", key),
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn file_stem(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(0) | None => filename,
        Some(idx) => &filename[..idx],
    }
}

/// Format the canonical `s3://bucket/key` URL.
pub fn format_s3_url(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}

/// Parse an object URL into `(bucket, key)`. Accepts `s3://bucket/key`,
/// virtual-hosted HTTP (`https://bucket.s3.region.amazonaws.com/key`),
/// path-style AWS (`https://s3.region.amazonaws.com/bucket/key`), and
/// path-style custom endpoints (`https://minio.example:9000/bucket/key`).
pub fn parse_url(url: &str) -> Option<(String, String)> {
    if let Some(rest) = url.strip_prefix("s3://") {
        let (bucket, key) = rest.split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        return Some((bucket.to_string(), key.to_string()));
    }

    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let (host, path) = rest.split_once('/')?;
    let host = host.split(':').next().unwrap_or(host);
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }

    if host.starts_with("s3.") {
        // Path-style AWS: first path segment is the bucket
        let (bucket, key) = path.split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        return Some((bucket.to_string(), key.to_string()));
    }

    if host.contains(".s3.") || host.ends_with(".amazonaws.com") {
        // Virtual-hosted: bucket is the leading host label
        let bucket = host.split('.').next()?;
        if bucket.is_empty() {
            return None;
        }
        return Some((bucket.to_string(), path.to_string()));
    }

    // Custom endpoint, path-style
    let (bucket, key) = path.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((bucket.to_string(), key.to_string()))
}

/// Content-Type chosen from the file extension; unknown extensions fall back
/// to `application/octet-stream`.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("md") => "text/markdown",
        Some("txt") => "text/plain",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some("doc") => "application/msword",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("xls") => "application/vnd.ms-excel",
        Some("pptx") => {
            "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        }
        Some("ppt") => "application/vnd.ms-powerpoint",
        Some("zip") => "application/zip",
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_source<'a>(bucket: &'a str, key: &'a str) -> OutputKeySource<'a> {
        OutputKeySource {
            bucket: Some(bucket),
            key: Some(key),
            ..Default::default()
        }
    }

    #[test]
    fn test_derive_plain_key() {
        let source = object_source("docs", "rep.pdf");
        assert_eq!(
            derive_output_prefix(&source, TaskType::PdfToMarkdown, 1, "ai-file"),
            "docs/rep/markdown"
        );
        assert_eq!(
            derive_output_key(&source, TaskType::PdfToMarkdown, 1, "ai-file", "rep.md"),
            "docs/rep/markdown/rep.md"
        );
    }

    #[test]
    fn test_derive_with_folder() {
        let source = object_source("gaojiaqi", "浙音文件/2024本科生学生手册.pdf");
        assert_eq!(
            derive_output_prefix(&source, TaskType::PdfToMarkdown, 9, "ai-file"),
            "gaojiaqi/浙音文件/2024本科生学生手册/markdown"
        );
    }

    #[test]
    fn test_derive_recovers_real_source() {
        // Input already lives in the output bucket from an earlier conversion
        let source = object_source("ai-file", "test/杭电申报-428定/pdf/杭电申报-428定.pdf");
        assert_eq!(
            derive_output_prefix(&source, TaskType::PdfToMarkdown, 5, "ai-file"),
            "test/杭电申报-428定/markdown"
        );
    }

    #[test]
    fn test_derive_nested_shape_mismatch_uses_plain_rule() {
        // Contains /pdf/ but not at the expected depth
        let source = object_source("ai-file", "pdf/rep.pdf");
        assert_eq!(
            derive_output_prefix(&source, TaskType::OfficeToPdf, 5, "ai-file"),
            "ai-file/pdf/rep/pdf"
        );
    }

    #[test]
    fn test_derive_platform_fallback() {
        let source = OutputKeySource {
            platform: Some("gaojiaqi"),
            input_path: Some("/data/in/manual.docx"),
            ..Default::default()
        };
        assert_eq!(
            derive_output_prefix(&source, TaskType::OfficeToPdf, 3, "ai-file"),
            "gaojiaqi/manual/pdf"
        );
    }

    #[test]
    fn test_derive_final_fallback() {
        let source = OutputKeySource::default();
        assert_eq!(
            derive_output_prefix(&source, TaskType::PdfToMarkdown, 17, "ai-file"),
            "converted/17"
        );
    }

    #[test]
    fn test_derivation_is_pure() {
        let source = object_source("docs", "a/b/rep.pdf");
        let first = derive_output_prefix(&source, TaskType::PdfToMarkdown, 2, "ai-file");
        let second = derive_output_prefix(&source, TaskType::PdfToMarkdown, 2, "ai-file");
        assert_eq!(first, second);
        assert_eq!(first, "docs/a/b/rep/markdown");
    }

    #[test]
    fn test_parse_url_roundtrip() {
        let cases = [
            ("docs", "rep.pdf"),
            ("gaojiaqi", "浙音文件/2024本科生学生手册.pdf"),
            ("ai-file", "a/b/c.md"),
        ];
        for (bucket, key) in cases {
            let url = format_s3_url(bucket, key);
            assert_eq!(
                parse_url(&url),
                Some((bucket.to_string(), key.to_string())),
                "roundtrip failed for {}",
                url
            );
        }
    }

    #[test]
    fn test_parse_http_forms() {
        assert_eq!(
            parse_url("https://docs.s3.us-east-1.amazonaws.com/a/rep.pdf"),
            Some(("docs".to_string(), "a/rep.pdf".to_string()))
        );
        assert_eq!(
            parse_url("https://s3.us-east-1.amazonaws.com/docs/rep.pdf"),
            Some(("docs".to_string(), "rep.pdf".to_string()))
        );
        assert_eq!(
            parse_url("http://minio.internal:9000/ai-file/docs/rep/markdown/rep.md"),
            Some(("ai-file".to_string(), "docs/rep/markdown/rep.md".to_string()))
        );
        assert_eq!(parse_url("not a url"), None);
        assert_eq!(parse_url("s3://bucket-only"), None);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("a.pdf")), "application/pdf");
        assert_eq!(content_type_for(Path::new("a.md")), "text/markdown");
        assert_eq!(content_type_for(Path::new("a.json")), "application/json");
        assert_eq!(
            content_type_for(Path::new("a.docx")),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        assert_eq!(
            content_type_for(Path::new("a.unknown")),
            "application/octet-stream"
        );
        assert_eq!(content_type_for(Path::new("a.PDF")), "application/pdf");
    }
}
