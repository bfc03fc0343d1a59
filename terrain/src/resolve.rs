//! Locating tile files, downloading them when needed.

use crate::{
    http::HttpClient,
    store::{file_name, TileKey, TileStats, GEOTIFF_EXT},
    TerrainError,
};
use log::{debug, info, warn};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

/// Where tile GeoTIFFs come from.
pub enum Resolver {
    /// Tiles are already on disk in this directory.
    Local { dir: PathBuf },

    /// Tiles are cached on disk and fetched from a map service on a
    /// miss.
    Remote(RemoteTiles),
}

impl Resolver {
    pub fn local<P: Into<PathBuf>>(dir: P) -> Self {
        Self::Local { dir: dir.into() }
    }

    /// Returns the path of the GeoTIFF for `key`.
    pub(crate) fn resolve(
        &self,
        key: TileKey,
        tile_size: i32,
        stats: &mut TileStats,
    ) -> Result<PathBuf, TerrainError> {
        match self {
            Self::Local { dir } => {
                let path = dir.join(file_name(key, tile_size, GEOTIFF_EXT));
                if !path.exists() {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no tile file {}", path.display()),
                    )
                    .into());
                }
                stats.from_disk += 1;
                Ok(path)
            }
            Self::Remote(remote) => remote.resolve(key, tile_size, stats),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Total download attempts per tile, including the first.
    pub attempts: u32,

    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// Disk-cached tiles backed by a map service.
pub struct RemoteTiles {
    dir: PathBuf,

    /// Request URL with `{bbox}`, `{width}`, and `{height}`
    /// placeholders.
    url_template: String,

    client: Box<dyn HttpClient>,

    retry: RetryPolicy,

    /// Cached files at most this many bytes long are checked for an
    /// error response before being trusted.
    min_valid_len: u64,

    /// Text identifying a quota error response.
    quota_marker: String,
}

impl RemoteTiles {
    pub const DEFAULT_MIN_VALID_LEN: u64 = 1024;
    pub const DEFAULT_QUOTA_MARKER: &'static str = "Rate limit exceeded";

    pub fn new<P, S>(
        dir: P,
        url_template: S,
        client: Box<dyn HttpClient>,
    ) -> Result<Self, TerrainError>
    where
        P: Into<PathBuf>,
        S: Into<String>,
    {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            url_template: url_template.into(),
            client,
            retry: RetryPolicy::default(),
            min_valid_len: Self::DEFAULT_MIN_VALID_LEN,
            quota_marker: Self::DEFAULT_QUOTA_MARKER.to_string(),
        })
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn min_valid_len(mut self, bytes: u64) -> Self {
        self.min_valid_len = bytes;
        self
    }

    #[must_use]
    pub fn quota_marker<S: Into<String>>(mut self, marker: S) -> Self {
        self.quota_marker = marker.into();
        self
    }

    /// Returns the request URL for the tile at `key`.
    pub fn url(&self, key: TileKey, tile_size: i32) -> String {
        let bbox = format!(
            "{},{},{},{}",
            key.x,
            key.y,
            key.x + tile_size,
            key.y + tile_size
        );
        let size = tile_size.to_string();
        self.url_template
            .replace("{bbox}", &bbox)
            .replace("{width}", &size)
            .replace("{height}", &size)
    }
}

/// Private API.
impl RemoteTiles {
    fn resolve(
        &self,
        key: TileKey,
        tile_size: i32,
        stats: &mut TileStats,
    ) -> Result<PathBuf, TerrainError> {
        let path = self.dir.join(file_name(key, tile_size, GEOTIFF_EXT));
        if self.cached(&path)? {
            stats.from_disk += 1;
            return Ok(path);
        }

        let url = self.url(key, tile_size);
        let attempts = self.retry.attempts;
        let mut last = None;
        for attempt in 1..=attempts {
            match self.client.get(&url).and_then(|body| self.check_body(body)) {
                Ok(body) => {
                    write_atomic(&path, &body)?;
                    stats.downloaded += 1;
                    info!("downloaded {} bytes to {path:?}", body.len());
                    return Ok(path);
                }
                Err(e) => {
                    if let TerrainError::QuotaExceeded(_) = e {
                        stats.quota_failures += 1;
                    } else {
                        stats.other_failures += 1;
                    }
                    warn!("tile {key:?}, attempt {attempt}/{attempts} failed, {e}");
                    last = Some(e);
                    if attempt < attempts {
                        thread::sleep(self.retry.delay);
                    }
                }
            }
        }

        Err(TerrainError::Download {
            key,
            attempts,
            source: Box::new(
                last.unwrap_or_else(|| TerrainError::Service("no attempts allowed".to_string())),
            ),
        })
    }

    /// Returns true if a usable tile file is already at `path`.
    ///
    /// Small files holding a stored error response are deleted.
    fn cached(&self, path: &Path) -> Result<bool, TerrainError> {
        let len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if len > self.min_valid_len {
            return Ok(true);
        }
        match error_payload(&fs::read(path)?) {
            Some(message) => {
                warn!("removing stale error response {path:?}, {message}");
                fs::remove_file(path)?;
                Ok(false)
            }
            None if len == 0 => {
                debug!("removing empty tile file {path:?}");
                fs::remove_file(path)?;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    fn check_body(&self, body: Vec<u8>) -> Result<Vec<u8>, TerrainError> {
        if body.is_empty() {
            return Err(TerrainError::Service("empty response".to_string()));
        }
        match error_payload(&body) {
            Some(message) if message.contains(&self.quota_marker) => {
                Err(TerrainError::QuotaExceeded(message))
            }
            Some(message) => Err(TerrainError::Service(message)),
            None => Ok(body),
        }
    }
}

/// Returns the condensed text of `body` if it looks like an XML error
/// response rather than a GeoTIFF.
fn error_payload(body: &[u8]) -> Option<String> {
    const BOM: &[u8] = b"\xEF\xBB\xBF";
    const MAX_LEN: usize = 240;

    let body = body.strip_prefix(BOM).unwrap_or(body);
    let start = body.iter().position(|b| !b.is_ascii_whitespace())?;
    let body = &body[start..];
    if !body.starts_with(b"<") {
        return None;
    }
    let text = String::from_utf8_lossy(body);
    let mut message = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some((idx, _)) = message.char_indices().nth(MAX_LEN) {
        message.truncate(idx);
    }
    Some(message)
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<(), TerrainError> {
    let partial = path.with_extension("partial");
    {
        let mut file = fs::File::create(&partial)?;
        file.write_all(body)?;
        file.sync_all()?;
    }
    fs::rename(&partial, path)?;
    Ok(())
}
