// src/response.rs
use std::path::{Component, Path, PathBuf};

use tracing::{error, info};

use crate::filemap::{FileMap, Stage};

/// Fallback body when even the canned error page cannot be loaded.
const ERROR_HTML: &str = "<html><title>Error</title>\
                          <body bgcolor=\"ffffff\">\
                          Error HTML\
                          <p>File Not Found</p>\
                          <hr><em>WebServer</em></body></html>";

const KEEP_ALIVE_HEADER: &str = "Connection: keep-alive\r\nkeep-alive: max=6, timeout=120\r\n";
const CLOSE_HEADER: &str = "Connection: close\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    Unknown,
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
}

impl HttpCode {
    pub fn as_int(self) -> i32 {
        match self {
            HttpCode::Unknown => -1,
            HttpCode::Ok => 200,
            HttpCode::BadRequest => 400,
            HttpCode::Forbidden => 403,
            HttpCode::NotFound => 404,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            HttpCode::Unknown => "Unknown",
            HttpCode::Ok => "OK",
            HttpCode::BadRequest => "Bad Request",
            HttpCode::Forbidden => "Forbidden",
            HttpCode::NotFound => "Not Found",
        }
    }

    /// Canned page served for error codes, relative to the document root.
    fn canned_page(self) -> Option<&'static str> {
        match self {
            HttpCode::BadRequest => Some("400.html"),
            HttpCode::Forbidden => Some("403.html"),
            HttpCode::NotFound => Some("404.html"),
            _ => None,
        }
    }
}

/// Response composer: resolves the request path under the document root,
/// selects the status code from the file-map outcome, and serializes the
/// header block. The body is either the file map (sent as a second iovec
/// segment) or the inline error HTML appended to the header block.
pub struct Response {
    base: PathBuf,
    full_path: PathBuf,
    code: HttpCode,
    keep_alive: bool,
    head: Vec<u8>,
    file: FileMap,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            base: PathBuf::new(),
            full_path: PathBuf::new(),
            code: HttpCode::Unknown,
            keep_alive: false,
            head: Vec::new(),
            file: FileMap::default(),
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the response to `base + path`. A non-Unknown `code` (parse
    /// failures) survives status selection.
    pub fn init(&mut self, base: &Path, path: &str, code: HttpCode, keep_alive: bool) {
        self.base = base.to_path_buf();
        self.full_path = resolve(base, path);
        self.code = code;
        self.keep_alive = keep_alive;
        self.head.clear();
        self.file = FileMap::default();
    }

    pub fn compose(&mut self) {
        self.file = FileMap::open(&self.full_path);

        self.choose_code();
        self.redirect_error_page();

        self.head.clear();
        self.compose_status();
        self.compose_header();
        self.compose_content();
    }

    pub fn code(&self) -> HttpCode {
        self.code
    }

    /// Serialized status line and header block, plus the inline error body
    /// when the file map failed.
    pub fn head(&self) -> &[u8] {
        &self.head
    }

    /// The file body; empty when the response carries an inline error.
    pub fn file_view(&self) -> &[u8] {
        self.file.view()
    }

    fn choose_code(&mut self) {
        if let Some(err) = self.file.error() {
            info!(
                "{}: {} ({})",
                stage_name(self.file.stage()),
                err.message,
                self.full_path.display()
            );
        }
        if self.code != HttpCode::Unknown {
            return;
        }
        self.code = match self.file.error() {
            Some(_) if self.file.stage() <= Stage::Open => HttpCode::NotFound,
            Some(_) => HttpCode::Forbidden,
            None => HttpCode::Ok,
        };
    }

    /// Error codes are answered with their canned page when one exists;
    /// a failed reopen falls through to the built-in literal.
    fn redirect_error_page(&mut self) {
        if let Some(page) = self.code.canned_page() {
            let path = self.base.join(page);
            let map = FileMap::open(&path);
            if let Some(err) = map.error() {
                error!(
                    "{}: {} ({})",
                    stage_name(map.stage()),
                    err.message,
                    path.display()
                );
            }
            self.file = map;
        }
    }

    fn compose_status(&mut self) {
        let line = format!("HTTP/1.1 {} {}\r\n", self.code.as_int(), self.code.reason());
        self.head.extend_from_slice(line.as_bytes());
    }

    fn compose_header(&mut self) {
        let connection = if self.keep_alive { KEEP_ALIVE_HEADER } else { CLOSE_HEADER };
        let body_len = if self.file.error().is_some() {
            ERROR_HTML.len()
        } else {
            self.file.size()
        };
        self.head.extend_from_slice(connection.as_bytes());
        // The MIME type follows the originally requested path, canned
        // error page or not.
        let header = format!(
            "Content-type: {}\r\nContent-Length: {}\r\n\r\n",
            mime_type(&self.full_path),
            body_len
        );
        self.head.extend_from_slice(header.as_bytes());
    }

    fn compose_content(&mut self) {
        if self.file.error().is_some() {
            self.head.extend_from_slice(ERROR_HTML.as_bytes());
        }
    }
}

/// `base + relative(path)`. A path trying to climb out of the document
/// root resolves to the root itself, which the file map then refuses as
/// unreadable.
fn resolve(base: &Path, path: &str) -> PathBuf {
    let rel = Path::new(path.trim_start_matches('/'));
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return base.to_path_buf();
    }
    base.join(rel)
}

fn stage_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Init => "INIT",
        Stage::Open => "OPEN",
        Stage::Fadvise => "FADVISE",
        Stage::Fstat => "FSTAT",
        Stage::Memalign => "MEMALIGN",
        Stage::Madvise => "MADVISE",
        Stage::Read => "READ",
        Stage::Finish => "FINISH",
    }
}

fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("xml") => "text/xml",
        Some("xhtml") => "application/xhtml+xml",
        Some("txt") => "text/plain",
        Some("rtf") => "application/rtf",
        Some("pdf") => "application/pdf",
        Some("word") => "application/msword",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("au") => "audio/basic",
        Some("mpeg") | Some("mpg") => "video/mpeg",
        Some("avi") => "video/x-msvideo",
        Some("gz") => "application/x-gzip",
        Some("tar") => "application/x-tar",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        _ => "text/plain",
    }
}
