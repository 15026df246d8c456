//! Manifest rewriter: points every URI in a playlist at the local gateway.
//!
//! Lossless for everything that is not a URI reference — comments, tags
//! without a `URI="..."` attribute and blank lines pass through verbatim,
//! since players depend on exact tag syntax elsewhere in the manifest.

use crate::error::CacheProxyError;
use crate::playlist::resolve_reference;
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

static URI_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"URI="([^"]*)""#).expect("valid regex"));

/// Rewrite `manifest_bytes` fetched from `origin` so that every segment,
/// variant, key and subtitle URI is mapped through `proxy_url_for`.
///
/// Fails only if the bytes are not decodable as UTF-8 text.
pub fn rewrite_manifest<F>(
    manifest_bytes: &[u8],
    origin: &Url,
    mut proxy_url_for: F,
) -> Result<String, CacheProxyError>
where
    F: FnMut(&Url) -> Url,
{
    let text = std::str::from_utf8(manifest_bytes)
        .map_err(|e| CacheProxyError::rewrite(format!("manifest is not UTF-8: {e}")))?;

    let rewritten: Vec<String> = text
        .split('\n')
        .map(|raw_line| rewrite_line(raw_line, origin, &mut proxy_url_for))
        .collect();

    Ok(rewritten.join("\n"))
}

fn rewrite_line<F>(raw_line: &str, origin: &Url, proxy_url_for: &mut F) -> String
where
    F: FnMut(&Url) -> Url,
{
    // Keep the line ending style: a stripped \r goes back onto any line
    // we rebuild, so CRLF manifests stay uniformly CRLF.
    let (line, eol) = match raw_line.strip_suffix('\r') {
        Some(stripped) => (stripped, "\r"),
        None => (raw_line, ""),
    };

    if line.is_empty() {
        return raw_line.to_owned();
    }

    if line.starts_with('#') {
        // Tags carrying URI="..." (keys, subtitles) get their attribute
        // substituted in place; everything else on the line is untouched.
        let Some(captures) = URI_ATTR.captures(line) else {
            return raw_line.to_owned();
        };
        let uri = &captures[1];
        let Some(resolved) = resolve_reference(origin, uri) else {
            return raw_line.to_owned();
        };
        let replacement = format!("URI=\"{}\"", proxy_url_for(&resolved));
        // NoExpand: proxied URLs may legally contain `$`, which must not
        // be treated as a capture reference.
        let rewritten = URI_ATTR.replace(line, regex::NoExpand(&replacement));
        return format!("{rewritten}{eol}");
    }

    // Bare segment/variant reference: the whole line becomes the proxy URL.
    match resolve_reference(origin, line) {
        Some(resolved) => format!("{}{eol}", proxy_url_for(&resolved)),
        None => raw_line.to_owned(),
    }
}
