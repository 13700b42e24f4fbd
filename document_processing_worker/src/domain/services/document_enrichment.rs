use std::path::Path;

use common::domain::entities::{
    document::{DocumentEnrichment, DocumentMeta},
    document_status::DocumentStatus,
};

pub const MAX_TITLE_CHARS: usize = 120;

const UTF8_BOM: char = '\u{feff}';

/// Derives title, content and meta of a document from its stored bytes
///
/// Only depends on its inputs, so processing the same document twice commits the same result.
///
/// Text files (valid UTF-8, no NUL byte) are fully processed. Anything else only gets a title
/// and its meta, and stays `pre-processed` for a later content extraction step.
pub fn enrich_document(file_name: &str, bytes: &[u8]) -> DocumentEnrichment {
    match as_text(bytes) {
        Some(text) => enrich_text(file_name, text, bytes.len()),
        None => enrich_binary(file_name, bytes.len()),
    }
}

fn as_text(bytes: &[u8]) -> Option<&str> {
    std::str::from_utf8(bytes)
        .ok()
        .filter(|text| !text.contains('\0'))
}

fn enrich_text(file_name: &str, text: &str, byte_size: usize) -> DocumentEnrichment {
    let content = normalize_line_endings(text.trim_start_matches(UTF8_BOM));

    let title = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(MAX_TITLE_CHARS).collect::<String>())
        .unwrap_or_else(|| file_stem(file_name));

    let mut meta = common_meta(file_name, byte_size, "text/plain");
    meta.insert("line_count".to_string(), content.lines().count().to_string());
    meta.insert(
        "word_count".to_string(),
        content.split_whitespace().count().to_string(),
    );

    DocumentEnrichment {
        title,
        content,
        meta,
        status: DocumentStatus::Processed,
    }
}

fn enrich_binary(file_name: &str, byte_size: usize) -> DocumentEnrichment {
    DocumentEnrichment {
        title: file_stem(file_name),
        content: String::new(),
        meta: common_meta(file_name, byte_size, "application/octet-stream"),
        status: DocumentStatus::PreProcessed,
    }
}

fn common_meta(file_name: &str, byte_size: usize, fallback_content_type: &str) -> DocumentMeta {
    let content_type = content_type_of(file_name).unwrap_or(fallback_content_type);

    DocumentMeta::from([
        ("content_type".to_string(), content_type.to_string()),
        ("byte_size".to_string(), byte_size.to_string()),
        ("source_file".to_string(), file_name.to_string()),
    ])
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn file_stem(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| file_name.to_string())
}

fn content_type_of(file_name: &str) -> Option<&'static str> {
    mime_guess::from_path(file_name).first_raw()
}
