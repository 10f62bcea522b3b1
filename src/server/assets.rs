//! Embedded frontend assets.
//!
//! The templates and static files are compiled into the binary so a plain
//! `ttyshare` invocation needs nothing on disk. `--frontend-path` swaps in a
//! directory instead, which is handy while editing the frontend.

use std::path::Path;

pub const VIEWER_TEMPLATE: &str = "tty-share.in.html";
pub const NOT_FOUND_TEMPLATE: &str = "404.in.html";

const EMBEDDED: &[(&str, &[u8])] = &[
    (
        "tty-share.in.html",
        include_bytes!("../../assets/templates/tty-share.in.html"),
    ),
    (
        "404.in.html",
        include_bytes!("../../assets/templates/404.in.html"),
    ),
    (
        "tty-share.css",
        include_bytes!("../../assets/static/tty-share.css"),
    ),
];

/// Look up an embedded asset by file name.
pub fn embedded(name: &str) -> Option<&'static [u8]> {
    EMBEDDED
        .iter()
        .find(|(asset, _)| *asset == name)
        .map(|(_, data)| *data)
}

/// Load `name` from the frontend directory when one is configured, falling
/// back to the embedded copy.
pub async fn load(frontend_path: Option<&Path>, name: &str) -> Option<Vec<u8>> {
    if let Some(dir) = frontend_path {
        return tokio::fs::read(dir.join(name)).await.ok();
    }
    embedded(name).map(<[u8]>::to_vec)
}

/// Fill in the template placeholders.
pub fn render(template: &str, path_prefix: &str, ws_path: &str) -> String {
    template
        .replace("{{path_prefix}}", path_prefix)
        .replace("{{ws_path}}", ws_path)
}

/// Content type by file extension, defaulting to a byte stream.
pub fn content_type(name: &str) -> &'static str {
    match name.rsplit('.').next() {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}
