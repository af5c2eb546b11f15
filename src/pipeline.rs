//! The fetch pipeline for one identifier: scrape, download the stream with the
//! external m3u8 downloader, remux with ffmpeg, then best-effort artwork and
//! `.nfo` generation.

use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{Context, Result, bail};
use chrono::Local;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    library::{DOWNLOAD_INFO_FILE, Library},
    nfo::NfoDocument,
    scraper::{self, PageFetcher},
};

/// Paths of the two external programs the pipeline shells out to.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub downloader: PathBuf,
    pub ffmpeg: PathBuf,
}

impl Toolchain {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            downloader: config.downloader_path.clone(),
            ffmpeg: config.ffmpeg_path.clone(),
        }
    }

    /// Fails loudly when ffmpeg cannot be started. The downloader has no
    /// version flag, so it is only detected when the download step runs.
    pub fn check(&self) -> Result<()> {
        ensure_program_available(&self.ffmpeg, "-version")
    }
}

fn ensure_program_available(program: &Path, version_flag: &str) -> Result<()> {
    let status = Command::new(program)
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            program.display()
        ),
        Err(err) => bail!("{} is not installed or not in PATH: {}", program.display(), err),
    }
}

/// Which proxy settings to try for the stream download, in order.
#[derive(Debug, Clone, Default)]
pub struct ProxyPolicy {
    pub proxy: Option<String>,
    pub prefer_proxy: bool,
}

impl ProxyPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            proxy: config.proxy.clone(),
            prefer_proxy: config.is_need_video_proxy,
        }
    }

    /// A failed attempt is retried once with the opposite proxy choice, which
    /// only exists when a proxy is configured.
    pub fn attempts(&self) -> Vec<Option<&str>> {
        match self.proxy.as_deref() {
            None => vec![None],
            Some(proxy) if self.prefer_proxy => vec![Some(proxy), None],
            Some(proxy) => vec![None, Some(proxy)],
        }
    }
}

pub fn download_stream(
    tools: &Toolchain,
    url: &str,
    dest: &Path,
    policy: &ProxyPolicy,
) -> Result<()> {
    for (attempt, proxy) in policy.attempts().into_iter().enumerate() {
        if attempt > 0 {
            info!(
                "retrying download {}",
                if proxy.is_some() { "through the proxy" } else { "without the proxy" }
            );
        }
        let mut command = Command::new(&tools.downloader);
        command.arg("-u").arg(url).arg("-o").arg(dest);
        if let Some(proxy) = proxy {
            command.arg("-p").arg(proxy);
        }

        match command.stdin(Stdio::null()).status() {
            Ok(status) if status.success() && dest.is_file() => return Ok(()),
            Ok(status) => warn!("downloader exited with {status}"),
            Err(err) => warn!(
                "could not start {}: {err}",
                tools.downloader.display()
            ),
        }
    }
    bail!("stream download failed for {url}")
}

/// Copies the transport stream into an mp4 container and removes the `.ts`.
pub fn remux_to_mp4(tools: &Toolchain, ts: &Path, mp4: &Path) -> Result<()> {
    let status = Command::new(&tools.ffmpeg)
        .arg("-y")
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(ts)
        .arg("-c")
        .arg("copy")
        .arg("-f")
        .arg("mp4")
        .arg(mp4)
        .stdin(Stdio::null())
        .status()
        .with_context(|| format!("launching {}", tools.ffmpeg.display()))?;
    if !status.success() {
        bail!("ffmpeg exited with {status} while converting {}", ts.display());
    }
    if !mp4.is_file() {
        bail!("ffmpeg reported success but {} is missing", mp4.display());
    }
    fs::remove_file(ts).with_context(|| format!("removing {}", ts.display()))?;
    Ok(())
}

/// Identifiers that finished the pipeline, one per line.
pub fn load_archive(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut entries = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Some(id) = line.split_whitespace().last() {
            entries.insert(id.to_owned());
        }
    }
    Ok(entries)
}

pub fn append_to_archive(path: &Path, id: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening archive {}", path.display()))?;
    writeln!(file, "{id}").with_context(|| format!("writing archive entry for {id}"))?;
    Ok(())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("finalizing {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    AlreadyPresent(PathBuf),
    Downloaded(PathBuf),
}

pub struct Pipeline {
    config: AppConfig,
    library: Library,
    tools: Toolchain,
    fetcher: Box<dyn PageFetcher>,
}

impl Pipeline {
    pub fn new(config: AppConfig, fetcher: Box<dyn PageFetcher>) -> Self {
        Self {
            library: Library::new(config.save_path.clone(), &config.base_url),
            tools: Toolchain::from_config(&config),
            config,
            fetcher,
        }
    }

    pub fn tools(&self) -> &Toolchain {
        &self.tools
    }

    /// Runs every step for `id`. `report` receives coarse progress so the
    /// caller can surface it; the downloader prints its own progress too.
    pub fn run(
        &self,
        id: &str,
        force: bool,
        report: &mut dyn FnMut(u8, &str),
    ) -> Result<FetchOutcome> {
        let archive_path = self.library.archive_path();
        if !force && load_archive(&archive_path)?.contains(id) {
            if let Some(existing) = self.library.find_video_file(id) {
                report(100, "already downloaded");
                return Ok(FetchOutcome::AlreadyPresent(existing));
            }
            info!("{id} is archived but its video is missing, fetching again");
        }

        let dir = self.library.video_dir(id);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        report(5, "resolving stream");
        let outcome = scraper::scrape(
            self.fetcher.as_ref(),
            &self.config.enabled_providers(),
            id,
        )?;
        let page_path = dir.join(format!("{id}.html"));
        fs::write(&page_path, &outcome.html)
            .with_context(|| format!("writing {}", page_path.display()))?;
        write_json_atomic(&dir.join(DOWNLOAD_INFO_FILE), &outcome.info)?;
        report(15, &format!("stream found via {}", outcome.provider));

        let ts = dir.join(format!("{id}.ts"));
        let mp4 = dir.join(format!("{id}.mp4"));
        report(20, "downloading stream");
        download_stream(
            &self.tools,
            &outcome.info.m3u8,
            &ts,
            &ProxyPolicy::from_config(&self.config),
        )?;

        report(85, "converting to mp4");
        remux_to_mp4(&self.tools, &ts, &mp4)?;

        report(92, "fetching artwork");
        let images = scraper::download_images(
            self.fetcher.as_ref(),
            &dir,
            id,
            &outcome.metadata,
            &outcome.page_url,
        );
        let actors = scraper::download_actor_thumbs(
            self.fetcher.as_ref(),
            &self.library.thumb_dir(),
            &outcome.metadata.actors,
            &outcome.page_url,
        );
        let metadata = outcome.metadata;
        let nfo = NfoDocument {
            id: id.to_string(),
            title: outcome.info.title.clone(),
            plot: metadata.description,
            release_date: metadata.release_date,
            runtime_minutes: metadata.runtime_minutes,
            genres: metadata.keywords,
            actors,
            // A portrait cover is the poster as it is.
            poster: images.poster.or_else(|| images.fanart.first().cloned()),
            fanart: images.fanart,
            source_url: Some(outcome.page_url.clone()),
        };
        if let Err(err) = nfo.write(&dir.join(format!("{id}.nfo")), Local::now().naive_local()) {
            warn!("{err:#}");
        }

        append_to_archive(&archive_path, id)?;
        report(100, "done");
        Ok(FetchOutcome::Downloaded(mp4))
    }
}
