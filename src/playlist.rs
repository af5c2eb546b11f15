//! Just enough HLS to choose a stream: master playlist variants and URI
//! resolution. Media playlists are handed to the external downloader as-is.

use anyhow::{Context, Result, anyhow};
use m3u8_rs::Playlist;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub bandwidth: u64,
    pub resolution: Option<String>,
    pub uri: String,
}

/// What a fetched `.m3u8` turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPlaylist {
    Master(Vec<Variant>),
    Media,
}

/// Parses a playlist body. I-frame-only variants are dropped since they
/// carry no playable audio.
pub fn parse(content: &str) -> Result<StreamPlaylist> {
    let playlist = m3u8_rs::parse_playlist_res(content.as_bytes())
        .map_err(|_| anyhow!("not a valid m3u8 playlist"))?;
    Ok(match playlist {
        Playlist::MasterPlaylist(master) => StreamPlaylist::Master(
            master
                .variants
                .into_iter()
                .filter(|variant| !variant.is_i_frame)
                .map(|variant| Variant {
                    bandwidth: variant.bandwidth,
                    resolution: variant
                        .resolution
                        .map(|resolution| format!("{}x{}", resolution.width, resolution.height)),
                    uri: variant.uri,
                })
                .collect(),
        ),
        Playlist::MediaPlaylist(_) => StreamPlaylist::Media,
    })
}

/// Highest bandwidth wins; on ties the first listed variant is kept.
pub fn best_variant(variants: &[Variant]) -> Option<&Variant> {
    variants.iter().fold(None, |best: Option<&Variant>, candidate| match best {
        Some(current) if current.bandwidth >= candidate.bandwidth => Some(current),
        _ => Some(candidate),
    })
}

/// Resolves `uri` relative to the playlist (or page) it was found in.
pub fn resolve_uri(base_url: &str, uri: &str) -> Result<String> {
    let uri = uri.trim();
    if let Ok(absolute) = Url::parse(uri)
        && matches!(absolute.scheme(), "http" | "https")
    {
        return Ok(absolute.to_string());
    }
    let base = Url::parse(base_url).with_context(|| format!("invalid base url {base_url}"))?;
    let joined = base
        .join(uri)
        .with_context(|| format!("cannot resolve {uri} against {base_url}"))?;
    Ok(joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,CODECS=\"avc1.4d401e,mp4a.40.2\"\n\
640x360/video.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720\n\
1280x720/video.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=1400000,RESOLUTION=842x480\n\
https://other.cdn/842x480/video.m3u8\n";

    const MEDIA: &str =
        "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10,\nseg0.ts\n#EXT-X-ENDLIST\n";

    fn variants() -> Vec<Variant> {
        match parse(MASTER).unwrap() {
            StreamPlaylist::Master(variants) => variants,
            StreamPlaylist::Media => panic!("expected a master playlist"),
        }
    }

    #[test]
    fn detects_master_and_media_playlists() {
        assert!(matches!(parse(MASTER).unwrap(), StreamPlaylist::Master(_)));
        assert_eq!(parse(MEDIA).unwrap(), StreamPlaylist::Media);
        assert!(parse("<html>not a playlist</html>").is_err());
    }

    #[test]
    fn parses_variants_with_quoted_codecs() {
        let variants = variants();
        assert_eq!(variants.len(), 3);
        assert_eq!(variants[0].bandwidth, 800_000);
        assert_eq!(variants[0].resolution.as_deref(), Some("640x360"));
        assert_eq!(variants[0].uri, "640x360/video.m3u8");
    }

    #[test]
    fn picks_highest_bandwidth() {
        let variants = variants();
        let best = best_variant(&variants).unwrap();
        assert_eq!(best.resolution.as_deref(), Some("1280x720"));
        assert!(best_variant(&[]).is_none());
    }

    #[test]
    fn resolves_relative_uris_against_playlist_directory() {
        let base = "https://cdn.test/abc/playlist.m3u8?token=1/2";
        assert_eq!(
            resolve_uri(base, "1280x720/video.m3u8").unwrap(),
            "https://cdn.test/abc/1280x720/video.m3u8"
        );
        assert_eq!(
            resolve_uri(base, "/root/video.m3u8").unwrap(),
            "https://cdn.test/root/video.m3u8"
        );
        assert_eq!(
            resolve_uri(base, "//mirror.test/v.m3u8").unwrap(),
            "https://mirror.test/v.m3u8"
        );
        assert_eq!(
            resolve_uri(base, "https://other.cdn/v.m3u8").unwrap(),
            "https://other.cdn/v.m3u8"
        );
        assert_eq!(
            resolve_uri("https://cdn.test", "v.m3u8").unwrap(),
            "https://cdn.test/v.m3u8"
        );
    }

    #[test]
    fn resolves_parent_segments() {
        assert_eq!(
            resolve_uri("https://cdn.test/a/b/playlist.m3u8", "../c/v.m3u8").unwrap(),
            "https://cdn.test/a/c/v.m3u8"
        );
        assert!(resolve_uri("not a url", "v.m3u8").is_err());
    }
}
