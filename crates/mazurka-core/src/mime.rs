//! Content-type and content-encoding classification.
//!
//! Filename extensions are peeled right to left.  Each suffix is first
//! looked up in the (small, linearly scanned) encodings table; a match is
//! recorded and peeling continues.  The first suffix that hits the
//! (binary-searched) type table fixes the content type and stops the peel.
//! Unknown suffixes are skipped.  With no type match at all the content
//! type falls back to `text/plain` in the server charset.

/// Applied-encoding suffixes, innermost last on disk (`foo.txt.gz`).
static ENC_TAB: &[(&str, &str)] = &[
    ("gz", "gzip"),
    ("uu", "x-uuencode"),
    ("z", "compress"),
];

/// Sorted by extension for binary search.  Text types carry a `%s` charset
/// placeholder that [`fixup_type`] fills in.
static TYP_TAB: &[(&str, &str)] = &[
    ("aac", "audio/aac"),
    ("avi", "video/x-msvideo"),
    ("bin", "application/octet-stream"),
    ("bmp", "image/bmp"),
    ("css", "text/css; charset=%s"),
    ("csv", "text/csv; charset=%s"),
    ("doc", "application/msword"),
    ("eot", "application/vnd.ms-fontobject"),
    ("flac", "audio/flac"),
    ("gif", "image/gif"),
    ("htm", "text/html; charset=%s"),
    ("html", "text/html; charset=%s"),
    ("ico", "image/x-icon"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("md", "text/markdown; charset=%s"),
    ("mid", "audio/midi"),
    ("mov", "video/quicktime"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("oga", "audio/ogg"),
    ("ogg", "audio/ogg"),
    ("ogv", "video/ogg"),
    ("otf", "font/otf"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("ps", "application/postscript"),
    ("rtf", "application/rtf"),
    ("svg", "image/svg+xml"),
    ("svgz", "image/svg+xml"),
    ("tar", "application/x-tar"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("txt", "text/plain; charset=%s"),
    ("wasm", "application/wasm"),
    ("wav", "audio/x-wav"),
    ("webm", "video/webm"),
    ("webp", "image/webp"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("xbm", "image/x-xbitmap"),
    ("xhtml", "application/xhtml+xml"),
    ("xml", "text/xml; charset=%s"),
    ("zip", "application/zip"),
];

pub const DEFAULT_TYPE: &str = "text/plain; charset=%s";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeInfo {
    /// Raw type string, possibly containing the `%s` charset placeholder.
    pub content_type: &'static str,
    /// Comma-joined encoding chain in application order, innermost first.
    pub encodings: String,
}

/// Classify a filename.
pub fn figure_mime(filename: &str) -> MimeInfo {
    let bytes = filename.as_bytes();
    let mut content_type = DEFAULT_TYPE;
    let mut peeled_encs: Vec<&'static str> = Vec::new();

    let mut prev_dot = bytes.len();
    loop {
        // Scan left for the next dot.
        let Some(dot) = bytes[..prev_dot].iter().rposition(|&b| b == b'.') else {
            break;
        };
        let ext: String = filename[dot + 1..prev_dot].to_ascii_lowercase();

        for (enc_ext, enc_val) in ENC_TAB {
            if *enc_ext == ext {
                peeled_encs.push(enc_val);
                break;
            }
        }

        if let Ok(i) = TYP_TAB.binary_search_by(|(e, _)| e.as_bytes().cmp(ext.as_bytes())) {
            content_type = TYP_TAB[i].1;
            break;
        }

        if dot == 0 {
            break;
        }
        prev_dot = dot;
    }

    // Serialize in application order: the encoding peeled last was applied
    // first.
    let mut encodings = String::new();
    for enc in peeled_encs.iter().rev() {
        if !encodings.is_empty() {
            encodings.push(',');
        }
        encodings.push_str(enc);
    }

    MimeInfo {
        content_type,
        encodings,
    }
}

/// Substitute the server charset into a type string's `%s` placeholder.
pub fn fixup_type(content_type: &str, charset: &str) -> String {
    content_type.replace("%s", charset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_table_is_sorted_and_unique() {
        for pair in TYP_TAB.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{} !< {}", pair[0].0, pair[1].0);
        }
    }

    #[test]
    fn plain_types() {
        assert_eq!(figure_mime("index.html").content_type, "text/html; charset=%s");
        assert_eq!(figure_mime("logo.png").content_type, "image/png");
        assert_eq!(figure_mime("UPPER.HTML").content_type, "text/html; charset=%s");
    }

    #[test]
    fn unknown_extension_defaults() {
        let info = figure_mime("README");
        assert_eq!(info.content_type, DEFAULT_TYPE);
        assert!(info.encodings.is_empty());
        assert_eq!(figure_mime("weird.xyzzy").content_type, DEFAULT_TYPE);
    }

    #[test]
    fn encoding_peeling() {
        let info = figure_mime("page.html.gz");
        assert_eq!(info.content_type, "text/html; charset=%s");
        assert_eq!(info.encodings, "gzip");
    }

    #[test]
    fn encoding_chain_is_application_ordered() {
        // foo.txt was uuencoded, then gzipped: applied order uuencode,gzip.
        let info = figure_mime("foo.txt.uu.gz");
        assert_eq!(info.content_type, "text/plain; charset=%s");
        assert_eq!(info.encodings, "x-uuencode,gzip");
    }

    #[test]
    fn unknown_suffix_is_skipped() {
        assert_eq!(
            figure_mime("notes.html.orig").content_type,
            "text/html; charset=%s"
        );
    }

    #[test]
    fn charset_fixup() {
        assert_eq!(
            fixup_type("text/html; charset=%s", "UTF-8"),
            "text/html; charset=UTF-8"
        );
        assert_eq!(fixup_type("image/png", "UTF-8"), "image/png");
    }
}
