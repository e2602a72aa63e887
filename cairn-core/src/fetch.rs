//! Fetching of remote and local files (cloud-init configs, images).

use crate::errors::{err, ErrorKind, Result};
use anyhow::Context;
use cairn_hal::SystemHal;
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use url::Url;

pub trait Fetcher: Send + Sync {
    /// Fetch `url` into `dest`.
    fn get(&self, url: &str, dest: &Path) -> Result<()>;
}

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_RETRIES: u32 = 3;

fn create_http_client(timeout_secs: u64) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("cairn/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Fetcher for plain paths, `file://`, `http(s)://`, and `ftp`/`tftp` URLs.
///
/// HTTP goes through reqwest; the FTP family is delegated to `curl`.
pub struct HttpFetcher {
    client: Client,
    hal: Arc<dyn SystemHal>,
    max_retries: u32,
    backoff: Duration,
}

impl HttpFetcher {
    pub fn new(hal: Arc<dyn SystemHal>) -> Result<Self> {
        Ok(Self {
            client: create_http_client(DEFAULT_TIMEOUT_SECS)?,
            hal,
            max_retries: DEFAULT_RETRIES,
            backoff: Duration::from_secs(1),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.backoff = backoff;
        self
    }

    fn get_http(&self, url: &str, dest: &Path) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            log::debug!("GET {} (attempt {}/{})", url, attempt, self.max_retries);
            match self.download_once(url, dest) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < self.max_retries {
                        sleep(self.backoff * (1 << attempt.min(5)));
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("download of {url} failed")))
    }

    fn download_once(&self, url: &str, dest: &Path) -> Result<()> {
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("{url} request failed"))?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("{} returned {}", url, response.status()));
        }
        let mut out = File::create(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        io::copy(&mut response, &mut out)
            .with_context(|| format!("failed to write {}", dest.display()))?;
        Ok(())
    }

    fn copy_local(&self, src: &Path, dest: &Path) -> Result<()> {
        fs::copy(src, dest).with_context(|| {
            format!("failed to copy {} to {}", src.display(), dest.display())
        })?;
        Ok(())
    }
}

impl Fetcher for HttpFetcher {
    fn get(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let parsed = match Url::parse(url) {
            Ok(u) => u,
            // Not a URL, so a local path.
            Err(_) => return self.copy_local(Path::new(url), dest),
        };

        match parsed.scheme() {
            "file" => self.copy_local(Path::new(parsed.path()), dest),
            "http" | "https" => self.get_http(url, dest),
            "ftp" | "ftps" | "tftp" => {
                let out = dest.to_string_lossy();
                self.hal
                    .run("curl", &["-fsSL", "-o", out.as_ref(), url])
                    .with_context(|| format!("failed to fetch {url}"))?;
                Ok(())
            }
            other => Err(err(
                ErrorKind::DownloadFile,
                format!("unsupported scheme '{other}' in {url}"),
            )),
        }
    }
}
