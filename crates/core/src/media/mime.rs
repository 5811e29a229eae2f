//! File-extension to MIME type lookup.

/// Served when a file has no recognised extension.
pub const DEFAULT: &str = "application/octet-stream";
pub const HTML: &str = "text/html";
pub const JPEG: &str = "image/jpeg";

const TABLE: &[(&str, &str)] = &[
    ("html", HTML),
    ("htm", HTML),
    ("shtml", HTML),
    ("text", "text/plain"),
    ("txt", "text/plain"),
    ("css", "text/css"),
    ("jpeg", JPEG),
    ("jpg", JPEG),
    ("gif", "image/gif"),
    ("png", "image/png"),
    ("js", "application/x-javascript"),
    ("wml", "text/vnd.wap.wml"),
];

/// Extension of the last path segment, without the dot.
pub fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = name.rsplit_once('.')?;
    (!stem.is_empty() && !ext.is_empty()).then_some(ext)
}

/// MIME type for `path`, matched case-insensitively on its extension.
pub fn from_path(path: &str) -> &'static str {
    extension(path)
        .and_then(|ext| {
            TABLE
                .iter()
                .find(|(known, _)| known.eq_ignore_ascii_case(ext))
                .map(|(_, mime)| *mime)
        })
        .unwrap_or(DEFAULT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions() {
        assert_eq!(from_path("/index.html"), "text/html");
        assert_eq!(from_path("/a/b/photo.JPG"), "image/jpeg");
        assert_eq!(from_path("style.css"), "text/css");
        assert_eq!(from_path("/notes.txt"), "text/plain");
    }

    #[test]
    fn unknown_or_missing_extension() {
        assert_eq!(from_path("/archive.tar.zst"), DEFAULT);
        assert_eq!(from_path("/README"), DEFAULT);
        assert_eq!(from_path("/dir.d/file"), DEFAULT);
        assert_eq!(from_path("/.hidden"), DEFAULT);
    }

    #[test]
    fn extension_of_last_segment() {
        assert_eq!(extension("/cgi/run.cgi"), Some("cgi"));
        assert_eq!(extension("/a.b/c"), None);
        assert_eq!(extension("trailing."), None);
    }
}
