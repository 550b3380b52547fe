//! Response body compression
//!
//! Buffered responses get one compression attempt before they go on the
//! wire: zstd if the requester accepts it, then brotli, then gzip. An attempt
//! that fails or does not shrink the body leaves it unchanged.

use std::io::Write;

/// Bodies below this size are not worth compressing.
pub const MIN_COMPRESS_SIZE: usize = 1024;

const COMPRESSIBLE_PREFIXES: &[&str] = &[
    "text/",
    "application/json",
    "application/javascript",
    "application/xml",
    "application/xhtml",
    "image/svg",
];

pub fn is_compressible(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    COMPRESSIBLE_PREFIXES
        .iter()
        .any(|prefix| essence.starts_with(prefix))
}

fn accepts(accept_encoding: &str, name: &str) -> bool {
    accept_encoding
        .split(',')
        .filter_map(|token| token.trim().split(';').next())
        .any(|token| token.trim().eq_ignore_ascii_case(name))
}

/// Try to compress `body`. Returns the encoding name and the compressed
/// bytes, or `None` when compression is not applicable or not worthwhile.
pub fn compress_body(
    accept_encoding: &str,
    content_type: &str,
    body: &[u8],
) -> Option<(&'static str, Vec<u8>)> {
    if body.len() < MIN_COMPRESS_SIZE || !is_compressible(content_type) {
        return None;
    }
    if accepts(accept_encoding, "zstd") {
        if let Some(out) = try_zstd(body) {
            return Some(("zstd", out));
        }
    }
    if accepts(accept_encoding, "br") {
        if let Some(out) = try_brotli(body) {
            return Some(("br", out));
        }
    }
    if accepts(accept_encoding, "gzip") {
        if let Some(out) = try_gzip(body) {
            return Some(("gzip", out));
        }
    }
    None
}

fn smaller(out: Vec<u8>, original: &[u8]) -> Option<Vec<u8>> {
    (out.len() < original.len()).then_some(out)
}

fn try_zstd(body: &[u8]) -> Option<Vec<u8>> {
    zstd::bulk::compress(body, 3)
        .ok()
        .and_then(|out| smaller(out, body))
}

fn try_brotli(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
        writer.write_all(body).ok()?;
    }
    smaller(out, body)
}

fn try_gzip(body: &[u8]) -> Option<Vec<u8>> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::with_capacity(body.len() / 2), flate2::Compression::new(6));
    encoder.write_all(body).ok()?;
    encoder.finish().ok().and_then(|out| smaller(out, body))
}
