//! Minimal HLS manifest parser.
//!
//! Extracts just what the prefetch path needs: media segments with their
//! `#EXTINF` durations, and master-playlist variants with their
//! `BANDWIDTH` attribute. Parsing is a pure in-memory transform with no
//! failure path: bytes that are not valid UTF-8 produce an empty media
//! document.

use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Master,
    Media,
}

/// One media segment and the playback duration it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub url: Url,
    pub duration: f64,
}

/// One bitrate option in a master playlist. `bandwidth` is `None` for
/// bare URL lines with no `#EXT-X-STREAM-INF` tag; those sort last.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub url: Url,
    pub bandwidth: Option<u64>,
}

impl Variant {
    /// Sort key placing unknown-bandwidth variants last/worst.
    pub fn bandwidth_or_max(&self) -> u64 {
        self.bandwidth.unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct PlaylistDocument {
    pub kind: PlaylistKind,
    pub segments: Vec<Segment>,
    pub variants: Vec<Variant>,
}

impl PlaylistDocument {
    fn empty_media() -> Self {
        Self {
            kind: PlaylistKind::Media,
            segments: Vec::new(),
            variants: Vec::new(),
        }
    }

    /// Sum of all segment durations, in seconds.
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// The variant with the lowest declared bandwidth. Unknown-bandwidth
    /// variants are only picked when nothing else is available.
    pub fn lowest_bandwidth_variant(&self) -> Option<&Variant> {
        self.variants.iter().min_by_key(|v| v.bandwidth_or_max())
    }
}

/// Resolve a manifest URI reference against the manifest's own URL.
///
/// Absolute URLs pass through unchanged, absolute paths inherit the
/// scheme/host/port of the base, relative paths resolve against the
/// base's parent path.
pub(crate) fn resolve_reference(base: &Url, reference: &str) -> Option<Url> {
    base.join(reference).ok()
}

/// Parse manifest bytes fetched from `base_url`.
///
/// Classification: a document with at least one variant and zero
/// segments is a master playlist; everything else (including an empty
/// document) is a media playlist.
pub fn parse(base_url: &Url, bytes: &[u8]) -> PlaylistDocument {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return PlaylistDocument::empty_media();
    };

    let lines: Vec<&str> = text.lines().collect();
    let mut segments = Vec::new();
    let mut variants = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();

        if line.starts_with("#EXT-X-STREAM-INF") {
            let bandwidth = extract_bandwidth(line);
            // The following non-comment line is this variant's URL.
            let mut j = i + 1;
            while j < lines.len() {
                let candidate = lines[j].trim();
                if candidate.is_empty() || candidate.starts_with('#') {
                    j += 1;
                    continue;
                }
                if let Some(url) = resolve_reference(base_url, candidate) {
                    variants.push(Variant { url, bandwidth });
                }
                break;
            }
            i = j + 1;
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration = rest
                .split(',')
                .next()
                .and_then(|d| d.trim().parse::<f64>().ok());
            // The following non-comment, non-empty line is the segment URL.
            let mut j = i + 1;
            while j < lines.len() {
                let candidate = lines[j].trim();
                if candidate.is_empty() || candidate.starts_with('#') {
                    j += 1;
                    continue;
                }
                if let (Some(duration), Some(url)) =
                    (duration, resolve_reference(base_url, candidate))
                {
                    segments.push(Segment { url, duration });
                }
                break;
            }
            i = j + 1;
            continue;
        }

        // Bare non-comment line with no preceding tag: a variant URL with
        // unknown bandwidth (some origins omit EXT-X-STREAM-INF).
        if !line.is_empty() && !line.starts_with('#') {
            if let Some(url) = resolve_reference(base_url, line) {
                variants.push(Variant {
                    url,
                    bandwidth: None,
                });
            }
        }
        i += 1;
    }

    if !variants.is_empty() && segments.is_empty() {
        PlaylistDocument {
            kind: PlaylistKind::Master,
            segments: Vec::new(),
            variants,
        }
    } else {
        PlaylistDocument {
            kind: PlaylistKind::Media,
            segments,
            variants: Vec::new(),
        }
    }
}

/// Pull the numeric value following `BANDWIDTH=` out of a stream-info
/// tag, ignoring `AVERAGE-BANDWIDTH=`.
fn extract_bandwidth(stream_inf: &str) -> Option<u64> {
    const ATTR: &str = "BANDWIDTH=";
    let mut search_from = 0;
    while let Some(pos) = stream_inf[search_from..].find(ATTR) {
        let abs = search_from + pos;
        let preceded_ok = match stream_inf[..abs].chars().next_back() {
            None => true,
            Some(c) => c == ':' || c == ',',
        };
        if preceded_ok {
            let tail = &stream_inf[abs + ATTR.len()..];
            let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
            return digits.parse().ok();
        }
        search_from = abs + ATTR.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/videos/1/hls/playlist.m3u8").unwrap()
    }

    #[test]
    fn media_playlist_segments_and_durations() {
        let manifest = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:4\n\
#EXTINF:4.000,\n\
seg0.ts\n\
#EXTINF:3.5,\n\
seg1.ts\n\
#EXT-X-ENDLIST\n";
        let doc = parse(&base(), manifest.as_bytes());
        assert_eq!(doc.kind, PlaylistKind::Media);
        assert_eq!(doc.segments.len(), 2);
        assert_eq!(
            doc.segments[0].url.as_str(),
            "https://example.com/videos/1/hls/seg0.ts"
        );
        assert_eq!(doc.segments[0].duration, 4.0);
        assert_eq!(doc.segments[1].duration, 3.5);
        assert!(doc.variants.is_empty());
    }

    #[test]
    fn master_playlist_variants_with_bandwidth() {
        let manifest = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=1280x720\n\
720p.m3u8\n\
#EXT-X-STREAM-INF:AVERAGE-BANDWIDTH=150000,BANDWIDTH=200000\n\
240p.m3u8\n";
        let doc = parse(&base(), manifest.as_bytes());
        assert_eq!(doc.kind, PlaylistKind::Master);
        assert_eq!(doc.variants.len(), 2);
        assert_eq!(doc.variants[0].bandwidth, Some(800_000));
        assert_eq!(doc.variants[1].bandwidth, Some(200_000));
        assert_eq!(
            doc.lowest_bandwidth_variant().unwrap().url.as_str(),
            "https://example.com/videos/1/hls/240p.m3u8"
        );
    }

    #[test]
    fn average_bandwidth_alone_is_not_bandwidth() {
        assert_eq!(
            extract_bandwidth("#EXT-X-STREAM-INF:AVERAGE-BANDWIDTH=150000"),
            None
        );
        assert_eq!(
            extract_bandwidth("#EXT-X-STREAM-INF:BANDWIDTH=640000,AVERAGE-BANDWIDTH=600000"),
            Some(640_000)
        );
    }

    #[test]
    fn classification_extinf_wins_over_variant_looking_lines() {
        // Any EXTINF entry forces a media classification.
        let manifest = "#EXTM3U\n\
low/playlist.m3u8\n\
#EXTINF:4.0,\n\
seg0.ts\n";
        let doc = parse(&base(), manifest.as_bytes());
        assert_eq!(doc.kind, PlaylistKind::Media);
        assert_eq!(doc.segments.len(), 1);
    }

    #[test]
    fn bare_urls_without_segments_are_unknown_bandwidth_variants() {
        let manifest = "#EXTM3U\nlow/playlist.m3u8\nhigh/playlist.m3u8\n";
        let doc = parse(&base(), manifest.as_bytes());
        assert_eq!(doc.kind, PlaylistKind::Master);
        assert_eq!(doc.variants.len(), 2);
        assert!(doc.variants.iter().all(|v| v.bandwidth.is_none()));
    }

    #[test]
    fn unknown_bandwidth_sorts_last() {
        let manifest = "#EXTM3U\n\
bare.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=400000\n\
400k.m3u8\n";
        let doc = parse(&base(), manifest.as_bytes());
        assert_eq!(doc.kind, PlaylistKind::Master);
        assert_eq!(
            doc.lowest_bandwidth_variant().unwrap().bandwidth,
            Some(400_000)
        );
    }

    #[test]
    fn url_resolution_variants() {
        let manifest = "#EXTM3U\n\
#EXTINF:1.0,\n\
relative.ts\n\
#EXTINF:1.0,\n\
/absolute/path.ts\n\
#EXTINF:1.0,\n\
https://cdn.example.net/full.ts\n";
        let doc = parse(&base(), manifest.as_bytes());
        assert_eq!(
            doc.segments[0].url.as_str(),
            "https://example.com/videos/1/hls/relative.ts"
        );
        assert_eq!(
            doc.segments[1].url.as_str(),
            "https://example.com/absolute/path.ts"
        );
        assert_eq!(doc.segments[2].url.as_str(), "https://cdn.example.net/full.ts");
    }

    #[test]
    fn invalid_utf8_yields_empty_media_document() {
        let doc = parse(&base(), &[0xff, 0xfe, 0x00, 0x1b]);
        assert_eq!(doc.kind, PlaylistKind::Media);
        assert!(doc.segments.is_empty());
        assert!(doc.variants.is_empty());
    }

    #[test]
    fn empty_media_playlist_is_media_not_master() {
        let doc = parse(&base(), b"#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
        assert_eq!(doc.kind, PlaylistKind::Media);
        assert!(doc.segments.is_empty());
    }

    #[test]
    fn total_duration_sums_segments() {
        let manifest = "#EXTM3U\n#EXTINF:4.0,\na.ts\n#EXTINF:2.5,\nb.ts\n";
        let doc = parse(&base(), manifest.as_bytes());
        assert_eq!(doc.total_duration(), 6.5);
    }
}
