use std::collections::HashMap;
use std::path::Path;

/// Base URL used when no server is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:9000/api/v1";

/// `GET` upload limits.
pub const PATH_CONFIG: &str = "/upload/config";
/// `POST` multipart single-request upload.
pub const PATH_SIMPLE: &str = "/upload/simple";
/// `POST` JSON chunked-session init.
pub const PATH_CHUNK_INIT: &str = "/upload/chunk/init";
/// `POST` multipart chunk body.
pub const PATH_CHUNK: &str = "/upload/chunk";
/// `POST` JSON merge request.
pub const PATH_CHUNK_MERGE: &str = "/upload/chunk/merge";
/// `GET` server-side progress; the file ID is appended as a path segment.
pub const PATH_PROGRESS: &str = "/upload/progress";

/// Multipart field carrying the whole file in a simple upload.
pub const FIELD_FILE: &str = "file";
/// Multipart field carrying the server file ID.
pub const FIELD_FILE_ID: &str = "fileID";
/// Multipart field carrying the 0-based chunk index.
pub const FIELD_CHUNK_INDEX: &str = "chunkIndex";
/// Multipart field carrying the chunk MD5.
pub const FIELD_MD5: &str = "md5Hash";
/// Multipart field carrying the chunk bytes.
pub const FIELD_CHUNK: &str = "chunk";

/// Envelope `code` for a successful call.
pub const CODE_SUCCESS: i32 = 200;

/// Envelope `code` for an expired or missing session.
pub const CODE_UNAUTHORIZED: i32 = 401;

/// Server default chunk size: 2 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Server default maximum file size: 5 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Longest filename the server accepts.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// MIME type reported for unknown extensions.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Extension → MIME table mirrored from the server.
const EXTENSION_MIME_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("mp4", "video/mp4"),
    ("avi", "video/avi"),
    ("mov", "video/mov"),
    ("pdf", "application/pdf"),
    ("txt", "text/plain"),
    ("zip", "application/zip"),
    ("rar", "application/x-rar-compressed"),
];

/// Returns the MIME type for a filename based on its extension.
///
/// Matching is case-insensitive. Unknown extensions map to
/// [`DEFAULT_MIME_TYPE`].
pub fn mime_for_filename(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext {
        Some(ext) => EXTENSION_MIME_TYPES
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, mime)| *mime)
            .unwrap_or(DEFAULT_MIME_TYPE),
        None => DEFAULT_MIME_TYPE,
    }
}

/// The server's default MIME allow-list.
pub fn default_allowed_mime_types() -> HashMap<String, bool> {
    let mut allowed = HashMap::new();
    for (_, mime) in EXTENSION_MIME_TYPES {
        allowed.insert((*mime).to_string(), true);
    }
    allowed
}
