//! Provider scraping: fetch a page for an identifier, pull out the stream URL
//! and whatever metadata the provider's patterns describe.
//!
//! HTTP goes through the [`PageFetcher`] trait so the pipeline can be driven
//! by canned pages in tests. [`HttpFetcher`] is the real implementation on top
//! of `ureq`, honouring the configured proxy.

use std::{
    collections::HashSet,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use image::ImageFormat;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    config::ProviderConfig,
    library::DownloadInfo,
    nfo::NfoActor,
    playlist::{self, StreamPlaylist},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
/// Width to height of a cropped poster.
const POSTER_RATIO: (u64, u64) = (565, 800);

pub trait PageFetcher: Send + Sync {
    fn fetch_text(&self, url: &str, referer: Option<&str>) -> Result<String>;
    fn fetch_to_file(&self, url: &str, referer: Option<&str>, dest: &Path) -> Result<()>;
}

pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(proxy: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut builder = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT);
        if let Some(proxy) = proxy {
            let proxy = ureq::Proxy::new(proxy).with_context(|| format!("invalid proxy {proxy}"))?;
            builder = builder.proxy(proxy);
        }
        Ok(Self {
            agent: builder.build(),
        })
    }

    fn get(&self, url: &str, referer: Option<&str>) -> Result<ureq::Response> {
        let mut request = self
            .agent
            .get(url)
            .set("Accept", ACCEPT)
            .set("Accept-Language", "en-US,en;q=0.5");
        if let Some(referer) = referer {
            request = request.set("Referer", referer);
        }
        request.call().with_context(|| format!("requesting {url}"))
    }
}

impl PageFetcher for HttpFetcher {
    fn fetch_text(&self, url: &str, referer: Option<&str>) -> Result<String> {
        debug!("fetch {url}");
        self.get(url, referer)?
            .into_string()
            .with_context(|| format!("reading body of {url}"))
    }

    fn fetch_to_file(&self, url: &str, referer: Option<&str>, dest: &Path) -> Result<()> {
        debug!("download {url} -> {}", dest.display());
        let mut reader = self.get(url, referer)?.into_reader();
        let tmp = dest.with_extension("part");
        let mut file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        io::copy(&mut reader, &mut file).with_context(|| format!("downloading {url}"))?;
        fs::rename(&tmp, dest).with_context(|| format!("finalizing {}", dest.display()))?;
        Ok(())
    }
}

/// A performer credited on the page, with an avatar URL when the page has one.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorRef {
    pub name: String,
    pub thumb: Option<String>,
}

/// Metadata pulled from a provider page. URLs are absolute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetadata {
    pub title: Option<String>,
    /// Cover art. Landscape covers double as the first fanart and are cropped
    /// into the poster.
    pub cover: Option<String>,
    pub fanart: Vec<String>,
    pub description: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub runtime_minutes: Option<u32>,
    pub actors: Vec<ActorRef>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub provider: String,
    pub page_url: String,
    pub html: String,
    pub info: DownloadInfo,
    pub metadata: PageMetadata,
}

/// A provider with its patterns compiled.
pub struct Provider {
    config: ProviderConfig,
    stream: Regex,
    title: Option<Regex>,
    cover: Option<Regex>,
    fanart: Option<Regex>,
    description: Option<Regex>,
    release_date: Option<Regex>,
    duration: Option<Regex>,
    actor: Option<Regex>,
    keywords: Option<Regex>,
}

impl Provider {
    pub fn compile(config: &ProviderConfig) -> Result<Self> {
        let compile = |label: &str, pattern: &str| {
            Regex::new(pattern)
                .with_context(|| format!("provider {}: invalid {label} pattern", config.name))
        };
        let optional = |label: &str, pattern: &Option<String>| {
            pattern
                .as_deref()
                .map(|pattern| compile(label, pattern))
                .transpose()
        };

        Ok(Self {
            stream: compile("stream", &config.stream_pattern)?,
            title: optional("title", &config.title_pattern)?,
            cover: optional("poster", &config.poster_pattern)?,
            fanart: optional("fanart", &config.fanart_pattern)?,
            description: optional("description", &config.description_pattern)?,
            release_date: optional("release date", &config.release_date_pattern)?,
            duration: optional("duration", &config.duration_pattern)?,
            actor: optional("actor", &config.actor_pattern)?,
            keywords: optional("keywords", &config.keywords_pattern)?,
            config: config.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn page_urls(&self, id: &str) -> Vec<String> {
        let lower = id.to_ascii_lowercase();
        self.config
            .page_urls
            .iter()
            .map(|template| template.replace("{id_lower}", &lower).replace("{id}", id))
            .collect()
    }

    /// Stream URL found on the page, resolved against the page URL.
    pub fn extract_stream(&self, html: &str, page_url: &str) -> Option<String> {
        let raw = first_capture(&self.stream, html)?;
        resolve_url(page_url, raw)
    }

    pub fn extract_metadata(&self, html: &str, page_url: &str) -> PageMetadata {
        let text = |re: &Option<Regex>| {
            re.as_ref()
                .and_then(|re| first_capture(re, html))
                .map(decode_text)
                .filter(|value| !value.is_empty())
        };

        let cover = self
            .cover
            .as_ref()
            .and_then(|re| first_capture(re, html))
            .and_then(|url| resolve_url(page_url, url));

        let mut seen = HashSet::new();
        let fanart = self
            .fanart
            .as_ref()
            .map(|re| {
                re.captures_iter(html)
                    .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
                    .filter_map(|found| resolve_url(page_url, found.as_str()))
                    .filter(|url| seen.insert(url.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let release_date = text(&self.release_date).and_then(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .inspect_err(|err| debug!("ignoring release date {raw:?}: {err}"))
                .ok()
        });
        let runtime_minutes = text(&self.duration).and_then(|raw| {
            DIGITS_RE
                .find(&raw)
                .and_then(|digits| digits.as_str().parse::<u32>().ok())
        });
        let keywords = text(&self.keywords)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|keyword| !keyword.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        PageMetadata {
            title: text(&self.title),
            cover,
            fanart,
            description: text(&self.description),
            release_date,
            runtime_minutes,
            actors: self.extract_actors(html, page_url),
            keywords,
        }
    }

    /// Actors in page order, first occurrence of a name wins.
    fn extract_actors(&self, html: &str, page_url: &str) -> Vec<ActorRef> {
        let Some(re) = &self.actor else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        re.captures_iter(html)
            .filter_map(|caps| {
                let name = caps.name("name").or_else(|| caps.get(1))?;
                let name = decode_text(name.as_str());
                let thumb = caps
                    .name("thumb")
                    .and_then(|thumb| resolve_url(page_url, thumb.as_str()));
                Some(ActorRef { name, thumb })
            })
            .filter(|actor| !actor.name.is_empty() && seen.insert(actor.name.clone()))
            .collect()
    }
}

static DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("digits pattern compiles"));

fn first_capture<'h>(re: &Regex, haystack: &'h str) -> Option<&'h str> {
    let caps = re.captures(haystack)?;
    caps.get(1).or_else(|| caps.get(0)).map(|found| found.as_str())
}

fn decode_text(raw: &str) -> String {
    html_escape::decode_html_entities(raw.trim()).into_owned()
}

/// URLs embedded in scripts are often JSON-escaped or HTML-escaped.
fn clean_url(raw: &str) -> String {
    html_escape::decode_html_entities(raw.trim()).replace("\\/", "/")
}

fn resolve_url(page_url: &str, raw: &str) -> Option<String> {
    playlist::resolve_uri(page_url, &clean_url(raw))
        .inspect_err(|err| debug!("{err:#}"))
        .ok()
}

/// Tries every provider in order and returns the first one that yields a
/// playable stream.
pub fn scrape(
    fetcher: &dyn PageFetcher,
    providers: &[ProviderConfig],
    id: &str,
) -> Result<ScrapeOutcome> {
    if providers.is_empty() {
        bail!("no providers configured");
    }

    for config in providers {
        let provider = match Provider::compile(config) {
            Ok(provider) => provider,
            Err(err) => {
                warn!("skipping provider: {err:#}");
                continue;
            }
        };
        match scrape_provider(fetcher, &provider, id) {
            Ok(Some(outcome)) => return Ok(outcome),
            Ok(None) => info!("provider {} has no stream for {id}", provider.name()),
            Err(err) => warn!("provider {} failed for {id}: {err:#}", provider.name()),
        }
    }

    Err(anyhow!("no provider returned a stream for {id}"))
}

fn scrape_provider(
    fetcher: &dyn PageFetcher,
    provider: &Provider,
    id: &str,
) -> Result<Option<ScrapeOutcome>> {
    for page_url in provider.page_urls(id) {
        let html = match fetcher.fetch_text(&page_url, None) {
            Ok(html) => html,
            Err(err) => {
                debug!("{}: {err:#}", provider.name());
                continue;
            }
        };

        let Some(stream_url) = provider.extract_stream(&html, &page_url) else {
            debug!("{}: no stream on {page_url}", provider.name());
            continue;
        };
        let m3u8 = select_stream(fetcher, &stream_url, &page_url)?;
        let metadata = provider.extract_metadata(&html, &page_url);
        info!("{}: found stream for {id} on {page_url}", provider.name());

        return Ok(Some(ScrapeOutcome {
            provider: provider.name().to_string(),
            info: DownloadInfo {
                m3u8,
                title: metadata.title.clone().unwrap_or_default(),
                avid: id.to_string(),
            },
            page_url,
            html,
            metadata,
        }));
    }
    Ok(None)
}

/// Follows a master playlist down to its best variant. Media playlists are
/// returned unchanged.
pub fn select_stream(fetcher: &dyn PageFetcher, url: &str, referer: &str) -> Result<String> {
    let content = fetcher
        .fetch_text(url, Some(referer))
        .with_context(|| format!("fetching playlist {url}"))?;
    let variants = match playlist::parse(&content).with_context(|| format!("parsing {url}"))? {
        StreamPlaylist::Media => return Ok(url.to_string()),
        StreamPlaylist::Master(variants) => variants,
    };

    let best = playlist::best_variant(&variants)
        .ok_or_else(|| anyhow!("master playlist {url} lists no variants"))?;
    debug!(
        "best variant: {} bps {}",
        best.bandwidth,
        best.resolution.as_deref().unwrap_or("unknown resolution")
    );
    playlist::resolve_uri(url, &best.uri)
}

/// File names written for the downloaded artwork.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedImages {
    pub poster: Option<String>,
    pub fanart: Vec<String>,
}

/// Saves the cover as `<ID>-fanart-1.<ext>` and crops `<ID>-poster.jpg` out
/// of it, then numbers the samples from 2. Individual failures are logged and
/// skipped.
pub fn download_images(
    fetcher: &dyn PageFetcher,
    dir: &Path,
    id: &str,
    metadata: &PageMetadata,
    referer: &str,
) -> SavedImages {
    let mut saved = SavedImages::default();

    if let Some(url) = &metadata.cover {
        let name = format!("{id}-fanart-1.{}", image_extension(url));
        let path = dir.join(&name);
        match fetcher.fetch_to_file(url, Some(referer), &path) {
            Ok(()) => {
                saved.fanart.push(name);
                let poster = format!("{id}-poster.jpg");
                match crop_poster(&path, &dir.join(&poster)) {
                    Ok(true) => saved.poster = Some(poster),
                    Ok(false) => debug!("cover for {id} is already portrait"),
                    Err(err) => warn!("poster crop failed: {err:#}"),
                }
            }
            Err(err) => warn!("cover download failed: {err:#}"),
        }
    }

    for (index, url) in metadata.fanart.iter().enumerate() {
        let name = format!("{id}-fanart-{}.{}", index + 2, image_extension(url));
        match fetcher.fetch_to_file(url, Some(referer), &dir.join(&name)) {
            Ok(()) => saved.fanart.push(name),
            Err(err) => warn!("fanart download failed: {err:#}"),
        }
    }

    saved
}

/// Writes the right-hand `POSTER_RATIO` slice of a landscape cover as a JPEG.
/// Returns `false` without writing when the cover is taller than wide.
pub fn crop_poster(cover: &Path, poster: &Path) -> Result<bool> {
    let bytes = fs::read(cover).with_context(|| format!("reading {}", cover.display()))?;
    let image = image::load_from_memory(&bytes)
        .with_context(|| format!("decoding {}", cover.display()))?;
    let (width, height) = (image.width(), image.height());
    if width == 0 || height > width {
        return Ok(false);
    }

    let (ratio_width, ratio_height) = POSTER_RATIO;
    let target = (u64::from(height) * ratio_width / ratio_height) as u32;
    let target = target.clamp(1, width);
    image
        .crop_imm(width - target, 0, target, height)
        .to_rgb8()
        .save_with_format(poster, ImageFormat::Jpeg)
        .with_context(|| format!("writing {}", poster.display()))?;
    Ok(true)
}

/// Saves actor avatars to `thumb_dir/<name>.jpg`, once per name across the
/// whole library.
pub fn download_actor_thumbs(
    fetcher: &dyn PageFetcher,
    thumb_dir: &Path,
    actors: &[ActorRef],
    referer: &str,
) -> Vec<NfoActor> {
    actors
        .iter()
        .map(|actor| {
            let thumb = save_actor_thumb(fetcher, thumb_dir, actor, referer);
            NfoActor {
                name: actor.name.clone(),
                thumb: thumb.map(|path| path.to_string_lossy().into_owned()),
            }
        })
        .collect()
}

fn save_actor_thumb(
    fetcher: &dyn PageFetcher,
    thumb_dir: &Path,
    actor: &ActorRef,
    referer: &str,
) -> Option<PathBuf> {
    if !is_plain_file_name(&actor.name) {
        warn!("not saving avatar for actor {:?}", actor.name);
        return None;
    }
    let path = thumb_dir.join(format!("{}.jpg", actor.name));
    if path.is_file() {
        info!("avatar for {} already exists", actor.name);
        return Some(path);
    }

    let url = actor.thumb.as_deref()?;
    if let Err(err) = fs::create_dir_all(thumb_dir) {
        warn!("creating {}: {err}", thumb_dir.display());
        return None;
    }
    match fetcher.fetch_to_file(url, Some(referer), &path) {
        Ok(()) => Some(path),
        Err(err) => {
            warn!("avatar download failed: {err:#}");
            None
        }
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn image_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .filter(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or_else(|| "jpg".to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::{collections::HashMap, io::Cursor};

    /// Serves canned bodies by URL and records every request.
    #[derive(Default)]
    pub struct FakeFetcher {
        pages: HashMap<String, Vec<u8>>,
        pub requests: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        pub fn with(self, url: &str, body: &str) -> Self {
            self.with_bytes(url, body.as_bytes().to_vec())
        }

        pub fn with_bytes(mut self, url: &str, body: Vec<u8>) -> Self {
            self.pages.insert(url.to_string(), body);
            self
        }

        fn body(&self, url: &str) -> Result<Vec<u8>> {
            self.requests.lock().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow!("404 for {url}"))
        }
    }

    impl PageFetcher for FakeFetcher {
        fn fetch_text(&self, url: &str, _referer: Option<&str>) -> Result<String> {
            Ok(String::from_utf8(self.body(url)?)?)
        }

        fn fetch_to_file(&self, url: &str, _referer: Option<&str>, dest: &Path) -> Result<()> {
            fs::write(dest, self.body(url)?)?;
            Ok(())
        }
    }

    /// A solid PNG of the given size.
    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeFetcher, png};
    use super::*;
    use tempfile::tempdir;

    const PAGE: &str = r#"<html><head>
<meta property="og:title" content="ABC-123 Rainy &amp; Quiet Afternoon">
<meta property="og:image" content="/covers/abc-123.jpg">
<meta name="description" content="Two friends wait out the rain.">
<meta name="keywords" content="Drama, Slice of Life,,Rain">
</head><body>
<span class="header">Release Date:</span> 2023-11-02
<span class="header">Length:</span> 118 minutes
<a class="avatar" href="/star/1"><img src="/pics/aiko.jpg"><span>Aiko</span></a>
<a class="avatar" href="/star/2"><img src="https://img.test/mei.jpg"><span>Mei</span></a>
<a class="avatar" href="/star/1"><img src="/pics/aiko.jpg"><span>Aiko</span></a>
<script>var source = "https:\/\/cdn.test\/abc\/playlist.m3u8";</script>
<a class="sample" href="https://img.test/s1.jpg"></a>
<a class="sample" href="https://img.test/s2.png?w=1"></a>
<a class="sample" href="https://img.test/s1.jpg"></a>
</body></html>"#;

    const MASTER: &str = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=500,RESOLUTION=640x360\nlow/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=900,RESOLUTION=1920x1080\nhigh/index.m3u8\n";

    fn provider_config() -> ProviderConfig {
        ProviderConfig {
            name: "sample".into(),
            weight: 10,
            page_urls: vec![
                "https://site.test/missing/{id_lower}".into(),
                "https://site.test/v/{id}".into(),
            ],
            stream_pattern: r#"source = "([^"]+\.m3u8)""#.into(),
            title_pattern: Some(r#"og:title" content="[A-Z0-9]+-\d+ ([^"]+)""#.into()),
            poster_pattern: Some(r#"og:image" content="([^"]+)""#.into()),
            fanart_pattern: Some(r#"class="sample" href="([^"]+)""#.into()),
            description_pattern: Some(r#"name="description" content="([^"]+)""#.into()),
            release_date_pattern: Some(r#"Release Date:</span> ([^<\n]+)"#.into()),
            duration_pattern: Some(r#"Length:</span> ([^<\n]+)"#.into()),
            actor_pattern: Some(
                r#"class="avatar"[^>]*><img src="(?P<thumb>[^"]+)"><span>(?P<name>[^<]+)</span>"#
                    .into(),
            ),
            keywords_pattern: Some(r#"name="keywords" content="([^"]+)""#.into()),
        }
    }

    fn bare_config() -> ProviderConfig {
        ProviderConfig {
            description_pattern: None,
            release_date_pattern: None,
            duration_pattern: None,
            actor_pattern: None,
            keywords_pattern: None,
            ..provider_config()
        }
    }

    #[test]
    fn page_urls_expand_placeholders() {
        let provider = Provider::compile(&provider_config()).unwrap();
        assert_eq!(
            provider.page_urls("ABC-123"),
            vec![
                "https://site.test/missing/abc-123".to_string(),
                "https://site.test/v/ABC-123".to_string(),
            ]
        );
    }

    #[test]
    fn extract_metadata_resolves_and_dedups() {
        let provider = Provider::compile(&provider_config()).unwrap();
        let meta = provider.extract_metadata(PAGE, "https://site.test/v/ABC-123");
        assert_eq!(meta.title.as_deref(), Some("Rainy & Quiet Afternoon"));
        assert_eq!(
            meta.cover.as_deref(),
            Some("https://site.test/covers/abc-123.jpg")
        );
        assert_eq!(
            meta.fanart,
            vec!["https://img.test/s1.jpg", "https://img.test/s2.png?w=1"]
        );
        assert_eq!(
            provider.extract_stream(PAGE, "https://site.test/v/ABC-123").as_deref(),
            Some("https://cdn.test/abc/playlist.m3u8")
        );
    }

    #[test]
    fn extract_metadata_reads_descriptive_fields() {
        let provider = Provider::compile(&provider_config()).unwrap();
        let meta = provider.extract_metadata(PAGE, "https://site.test/v/ABC-123");
        assert_eq!(
            meta.description.as_deref(),
            Some("Two friends wait out the rain.")
        );
        assert_eq!(meta.release_date, NaiveDate::from_ymd_opt(2023, 11, 2));
        assert_eq!(meta.runtime_minutes, Some(118));
        assert_eq!(meta.keywords, vec!["Drama", "Slice of Life", "Rain"]);
        assert_eq!(
            meta.actors,
            vec![
                ActorRef {
                    name: "Aiko".into(),
                    thumb: Some("https://site.test/pics/aiko.jpg".into()),
                },
                ActorRef {
                    name: "Mei".into(),
                    thumb: Some("https://img.test/mei.jpg".into()),
                },
            ]
        );

        let bare = Provider::compile(&bare_config()).unwrap();
        let meta = bare.extract_metadata(PAGE, "https://site.test/v/ABC-123");
        assert!(meta.description.is_none());
        assert!(meta.actors.is_empty());
        assert!(meta.keywords.is_empty());
    }

    #[test]
    fn unparseable_release_date_is_dropped() {
        let provider = Provider::compile(&provider_config()).unwrap();
        let page = PAGE.replace("2023-11-02", "soon");
        let meta = provider.extract_metadata(&page, "https://site.test/v/ABC-123");
        assert!(meta.release_date.is_none());
    }

    #[test]
    fn scrape_falls_through_pages_and_picks_best_variant() {
        let fetcher = FakeFetcher::default()
            .with("https://site.test/v/ABC-123", PAGE)
            .with("https://cdn.test/abc/playlist.m3u8", MASTER);
        let outcome = scrape(&fetcher, &[provider_config()], "ABC-123").unwrap();
        assert_eq!(outcome.provider, "sample");
        assert_eq!(outcome.page_url, "https://site.test/v/ABC-123");
        assert_eq!(outcome.info.m3u8, "https://cdn.test/abc/high/index.m3u8");
        assert_eq!(outcome.info.avid, "ABC-123");
        assert_eq!(outcome.info.title, "Rainy & Quiet Afternoon");
        assert_eq!(
            fetcher.requests.lock()[0],
            "https://site.test/missing/abc-123"
        );
    }

    #[test]
    fn scrape_keeps_media_playlists() {
        let fetcher = FakeFetcher::default()
            .with("https://site.test/v/ABC-123", PAGE)
            .with(
                "https://cdn.test/abc/playlist.m3u8",
                "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4,\nseg0.ts\n#EXT-X-ENDLIST\n",
            );
        let outcome = scrape(&fetcher, &[provider_config()], "ABC-123").unwrap();
        assert_eq!(outcome.info.m3u8, "https://cdn.test/abc/playlist.m3u8");
    }

    #[test]
    fn scrape_tries_next_provider() {
        let broken = ProviderConfig {
            name: "broken".into(),
            stream_pattern: "(".into(),
            ..provider_config()
        };
        let empty = ProviderConfig {
            name: "empty".into(),
            page_urls: vec!["https://empty.test/{id}".into()],
            ..provider_config()
        };
        let fetcher = FakeFetcher::default()
            .with("https://empty.test/ABC-123", "<html>nothing here</html>")
            .with("https://site.test/v/ABC-123", PAGE)
            .with("https://cdn.test/abc/playlist.m3u8", MASTER);
        let outcome = scrape(&fetcher, &[broken, empty, provider_config()], "ABC-123").unwrap();
        assert_eq!(outcome.provider, "sample");
    }

    #[test]
    fn scrape_reports_total_failure() {
        let fetcher = FakeFetcher::default();
        let err = scrape(&fetcher, &[provider_config()], "ABC-123").unwrap_err();
        assert!(err.to_string().contains("no provider returned a stream"));
        assert!(scrape(&fetcher, &[], "ABC-123").is_err());
    }

    #[test]
    fn download_images_crops_poster_and_numbers_samples_from_two() {
        let dir = tempdir().unwrap();
        let fetcher = FakeFetcher::default()
            .with_bytes("https://img.test/cover.jpg", png(800, 400))
            .with("https://img.test/s2.png?w=1", "F3");
        let metadata = PageMetadata {
            cover: Some("https://img.test/cover.jpg".into()),
            fanart: vec![
                "https://img.test/missing.jpg".into(),
                "https://img.test/s2.png?w=1".into(),
            ],
            ..PageMetadata::default()
        };
        let saved = download_images(&fetcher, dir.path(), "ABC-1", &metadata, "https://site.test");
        assert_eq!(saved.poster.as_deref(), Some("ABC-1-poster.jpg"));
        assert_eq!(saved.fanart, vec!["ABC-1-fanart-1.jpg", "ABC-1-fanart-3.png"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("ABC-1-fanart-3.png")).unwrap(),
            "F3"
        );

        let poster = image::open(dir.path().join("ABC-1-poster.jpg")).unwrap();
        assert_eq!((poster.width(), poster.height()), (282, 400));
    }

    #[test]
    fn portrait_cover_is_not_cropped() {
        let dir = tempdir().unwrap();
        let cover = dir.path().join("cover.png");
        fs::write(&cover, png(300, 500)).unwrap();
        let poster = dir.path().join("poster.jpg");
        assert!(!crop_poster(&cover, &poster).unwrap());
        assert!(!poster.exists());

        fs::write(&cover, "not an image").unwrap();
        assert!(crop_poster(&cover, &poster).is_err());
    }

    #[test]
    fn actor_thumbs_are_saved_once() {
        let dir = tempdir().unwrap();
        let thumbs = dir.path().join("thumb");
        let fetcher = FakeFetcher::default().with("https://img.test/aiko.jpg", "A");
        let actors = vec![
            ActorRef {
                name: "Aiko".into(),
                thumb: Some("https://img.test/aiko.jpg".into()),
            },
            ActorRef {
                name: "Mei".into(),
                thumb: None,
            },
            ActorRef {
                name: "../escape".into(),
                thumb: Some("https://img.test/aiko.jpg".into()),
            },
        ];

        let saved = download_actor_thumbs(&fetcher, &thumbs, &actors, "https://site.test");
        let aiko = thumbs.join("Aiko.jpg");
        assert_eq!(saved[0].thumb, Some(aiko.to_string_lossy().into_owned()));
        assert_eq!(saved[1].name, "Mei");
        assert!(saved[1].thumb.is_none());
        assert!(saved[2].thumb.is_none());
        assert_eq!(fs::read_to_string(&aiko).unwrap(), "A");

        let again = download_actor_thumbs(&fetcher, &thumbs, &actors[..1], "https://site.test");
        assert_eq!(again[0].thumb, saved[0].thumb);
        let requests = fetcher.requests.lock();
        assert_eq!(
            requests
                .iter()
                .filter(|url| url.as_str() == "https://img.test/aiko.jpg")
                .count(),
            1
        );
    }
}
