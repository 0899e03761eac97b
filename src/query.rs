//! Query classification.
//!
//! Users type anything: a link to a track or playlist on some provider, an
//! explicit search directive like `ytsearch:lofi beats`, a path to a file or
//! folder, or just free text. The [`Classifier`] turns that into a [`Query`]
//! that says which source manager on the node should handle it, what kind of
//! result to expect, and what identifier to hand to the node.
//!
//! Classification is a fixed-priority pipeline where the first match wins:
//!
//! 1. Provider link patterns, in a fixed order
//! 2. Search directives (`<prefix>search:<text>`)
//! 3. Local paths, resolved through a [`LocalFileResolver`]
//! 4. Free text, searched on the configured fallback source
//!
//! # Example
//!
//! ```rust
//! use lavaclient::query::{Classifier, ClassifierConfig, QueryType, Source};
//!
//! let classifier = Classifier::with_fs(ClassifierConfig::default());
//! let query = classifier.classify_offline("https://open.spotify.com/playlist/abc123");
//! assert_eq!(query.source(), Source::Spotify);
//! assert_eq!(query.kind(), QueryType::Playlist);
//! ```

use std::{
    fmt,
    path::{Component, Path, PathBuf},
    sync::{Arc, LazyLock},
    time::Duration,
};

use async_trait::async_trait;
use regex_lite::{Captures, Regex};

use crate::{
    error::{Error, Result},
    track::{SourceName, TrackInfo},
};

/// Source managers a query can be routed to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Source {
    YouTube,
    YouTubeMusic,
    Spotify,
    AppleMusic,
    Deezer,
    YandexMusic,
    SoundCloud,
    Twitch,
    Speak,
    GoogleTts,
    ClypIt,
    GetYarn,
    Mixcloud,
    OcRemix,
    Pornhub,
    Reddit,
    SoundGasm,
    TikTok,
    Bandcamp,
    Niconico,
    Vimeo,
    Http,
    Local,
}

impl Source {
    /// Human-readable name of the source.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::YouTube => "YouTube",
            Self::YouTubeMusic => "YouTube Music",
            Self::Spotify => "Spotify",
            Self::AppleMusic => "Apple Music",
            Self::Deezer => "Deezer",
            Self::YandexMusic => "Yandex Music",
            Self::SoundCloud => "SoundCloud",
            Self::Twitch => "Twitch",
            Self::Speak => "speak",
            Self::GoogleTts => "Google TTS",
            Self::ClypIt => "Clyp.it",
            Self::GetYarn => "GetYarn",
            Self::Mixcloud => "Mixcloud",
            Self::OcRemix => "OverClocked ReMix",
            Self::Pornhub => "Pornhub",
            Self::Reddit => "Reddit",
            Self::SoundGasm => "SoundGasm",
            Self::TikTok => "TikTok",
            Self::Bandcamp => "Bandcamp",
            Self::Niconico => "Niconico",
            Self::Vimeo => "Vimeo",
            Self::Http => "HTTP",
            Self::Local => "Local Files",
        }
    }

    /// Name of the source manager a node must report to load this source.
    #[must_use]
    pub fn capability(self) -> &'static str {
        match self {
            Self::YouTube | Self::YouTubeMusic => "youtube",
            Self::Spotify => "spotify",
            Self::AppleMusic => "applemusic",
            Self::Deezer => "deezer",
            Self::YandexMusic => "yandexmusic",
            Self::SoundCloud => "soundcloud",
            Self::Twitch => "twitch",
            Self::Speak => "speak",
            Self::GoogleTts => "gcloud-tts",
            Self::ClypIt => "clypit",
            Self::GetYarn => "getyarn.io",
            Self::Mixcloud => "mixcloud",
            Self::OcRemix => "ocremix",
            Self::Pornhub => "pornhub",
            Self::Reddit => "reddit",
            Self::SoundGasm => "soundgasm",
            Self::TikTok => "tiktok",
            Self::Bandcamp => "bandcamp",
            Self::Niconico => "niconico",
            Self::Vimeo => "vimeo",
            Self::Http => "http",
            Self::Local => "local",
        }
    }

    /// Maps the source name a node stored in a track to a query source.
    ///
    /// Unknown source managers map to YouTube.
    #[must_use]
    pub fn from_source_name(name: &SourceName) -> Self {
        match name {
            SourceName::Youtube => Self::YouTubeMusic,
            SourceName::Soundcloud => Self::SoundCloud,
            SourceName::Bandcamp => Self::Bandcamp,
            SourceName::Twitch => Self::Twitch,
            SourceName::Vimeo => Self::Vimeo,
            SourceName::Local => Self::Local,
            SourceName::Http => Self::Http,
            SourceName::GetYarn => Self::GetYarn,
            SourceName::ClypIt => Self::ClypIt,
            SourceName::Speak => Self::Speak,
            SourceName::Pornhub => Self::Pornhub,
            SourceName::Reddit => Self::Reddit,
            SourceName::OcRemix => Self::OcRemix,
            SourceName::TikTok => Self::TikTok,
            SourceName::Mixcloud => Self::Mixcloud,
            SourceName::SoundGasm => Self::SoundGasm,
            SourceName::Spotify => Self::Spotify,
            SourceName::AppleMusic => Self::AppleMusic,
            SourceName::Deezer => Self::Deezer,
            SourceName::YandexMusic => Self::YandexMusic,
            SourceName::GoogleTts => Self::GoogleTts,
            SourceName::Niconico => Self::Niconico,
            SourceName::Other(_) => Self::YouTube,
        }
    }

    /// Parses a search source as accepted by [`Query::set_search_source`].
    fn from_search_alias(alias: &str) -> Option<Self> {
        let source = match alias.to_lowercase().as_str() {
            "ytm" => Self::YouTubeMusic,
            "yt" => Self::YouTube,
            "sp" => Self::Spotify,
            "sc" => Self::SoundCloud,
            "am" => Self::AppleMusic,
            "local" => Self::Local,
            "speak" => Self::Speak,
            "tts://" => Self::GoogleTts,
            _ => return None,
        };

        Some(source)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a query is expected to load.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum QueryType {
    #[default]
    Single,
    Playlist,
    Album,
}

/// A local file or folder that was found to exist.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocalPath {
    pub path: PathBuf,
    pub is_dir: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryValue {
    Text(String),
    Local(LocalPath),
}

/// A classified query.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Query {
    value: QueryValue,
    source: Source,
    kind: QueryType,
    search: bool,
    start_time: Duration,
    index: usize,
    recursive: bool,
}

impl Query {
    fn link(value: &str, source: Source) -> Self {
        Self {
            value: QueryValue::Text(value.to_owned()),
            source,
            kind: QueryType::Single,
            search: false,
            start_time: Duration::ZERO,
            index: 0,
            recursive: false,
        }
    }

    fn search(text: &str, source: Source) -> Self {
        Self {
            search: true,
            ..Self::link(text, source)
        }
    }

    fn of_kind(mut self, kind: QueryType) -> Self {
        self.kind = kind;
        self
    }

    fn starting_at(mut self, start_time: Duration) -> Self {
        self.start_time = start_time;
        self
    }

    #[must_use]
    pub fn value(&self) -> &QueryValue {
        &self.value
    }

    #[must_use]
    pub fn source(&self) -> Source {
        self.source
    }

    #[must_use]
    pub fn kind(&self) -> QueryType {
        self.kind
    }

    #[must_use]
    pub fn start_time(&self) -> Duration {
        self.start_time
    }

    /// Position in the playlist to start at.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether a local folder should be walked recursively.
    #[must_use]
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Returns a copy of this query that starts at `index`.
    #[must_use]
    pub fn with_index(&self, index: usize) -> Self {
        Self {
            index,
            ..self.clone()
        }
    }

    /// Changes which source a search is run on.
    ///
    /// `alias` is one of `ytm`, `yt`, `sp`, `sc`, `am`, `local`, `speak` or
    /// `tts://`, in any case.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` when this query is not a search, and
    /// `InvalidArgument` for any other alias.
    pub fn set_search_source(&mut self, alias: &str) -> Result<()> {
        if !self.search {
            return Err(Error::failed_precondition(
                "source can only be set for search queries",
            ));
        }

        self.source = Source::from_search_alias(alias).ok_or_else(|| {
            Error::invalid_argument(format!(
                "invalid source: {alias} (allowed: ytm, yt, sp, sc, am, local, speak, tts://)"
            ))
        })?;

        Ok(())
    }

    /// The string to hand to the node to load this query.
    #[must_use]
    pub fn canonical_identifier(&self) -> String {
        let text = match &self.value {
            QueryValue::Local(local) => return local.path.display().to_string(),
            QueryValue::Text(text) => text,
        };

        if !self.search {
            return text.clone();
        }

        match self.source {
            Source::YouTubeMusic => format!("ytmsearch:{text}"),
            Source::Spotify => format!("spsearch:{text}"),
            Source::AppleMusic => format!("amsearch:{text}"),
            Source::SoundCloud => format!("scsearch:{text}"),
            Source::Deezer => format!("dzsearch:{text}"),
            Source::Speak => {
                let text: String = text.chars().take(200).collect();
                format!("speak:{text}")
            }
            Source::GoogleTts => format!("tts://{text}"),
            _ => format!("ytsearch:{text}"),
        }
    }

    /// Name of the source manager a node needs to load this query.
    #[must_use]
    pub fn required_capability(&self) -> &'static str {
        self.source.capability()
    }

    #[must_use]
    pub fn is_search(&self) -> bool {
        self.search
    }

    #[must_use]
    pub fn is_single(&self) -> bool {
        self.kind == QueryType::Single
    }

    #[must_use]
    pub fn is_playlist(&self) -> bool {
        self.kind == QueryType::Playlist
    }

    #[must_use]
    pub fn is_album(&self) -> bool {
        self.kind == QueryType::Album
    }

    /// Whether this is a YouTube or YouTube Music query.
    #[must_use]
    pub fn is_youtube(&self) -> bool {
        matches!(self.source, Source::YouTube | Source::YouTubeMusic)
    }

    #[must_use]
    pub fn is_youtube_music(&self) -> bool {
        self.source == Source::YouTubeMusic
    }

    #[must_use]
    pub fn is_spotify(&self) -> bool {
        self.source == Source::Spotify
    }

    #[must_use]
    pub fn is_apple_music(&self) -> bool {
        self.source == Source::AppleMusic
    }

    #[must_use]
    pub fn is_soundcloud(&self) -> bool {
        self.source == Source::SoundCloud
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.source == Source::Local
    }

    #[must_use]
    pub fn is_http(&self) -> bool {
        self.source == Source::Http
    }

    #[must_use]
    pub fn is_speak(&self) -> bool {
        self.source == Source::Speak
    }

    #[must_use]
    pub fn is_google_tts(&self) -> bool {
        self.source == Source::GoogleTts
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_identifier())
    }
}

/// Filesystem access needed to classify local paths.
#[async_trait]
pub trait LocalFileResolver: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;

    async fn is_dir(&self, path: &Path) -> bool;

    /// Returns the absolute form of `path` with all symlinks resolved.
    async fn canonicalize(&self, path: &Path) -> Result<PathBuf>;
}

/// Resolves paths on the local filesystem.
#[derive(Copy, Clone, Debug, Default)]
pub struct FsResolver;

#[async_trait]
impl LocalFileResolver for FsResolver {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn is_dir(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .is_ok_and(|metadata| metadata.is_dir())
    }

    async fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        tokio::fs::canonicalize(path).await.map_err(Into::into)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Folder that relative and unresolvable absolute paths are looked up in.
    pub local_root: Option<PathBuf>,

    /// Source that free text is searched on.
    pub fallback_search: Source,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            local_root: None,
            fallback_search: Source::YouTubeMusic,
        }
    }
}

/// Builds a case-insensitive pattern.
///
/// # Panics
///
/// Panics if the pattern is invalid, which is a programming error.
fn pattern(re: &str) -> Regex {
    Regex::new(&format!("(?i){re}")).expect("invalid pattern")
}

static YOUTUBE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^(?:https?://)?(?:www\.)?(?P<music>music\.)?youtu(?:be\.com|\.be)"));
static SPOTIFY: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"^(?:https?://)?(?:www\.)?open\.spotify\.com/(?:user/[a-z\d_-]+/)?(?:track|album|playlist|artist)/[a-z\d_-]+",
    )
});
static APPLE_MUSIC: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"^(?:https?://)?(?:www\.)?music\.apple\.com/(?:[a-z]{2}/)?(?:album|playlist|artist)(?:/[a-z\d-]+)?/[a-z\d.]+",
    )
});
static SOUNDCLOUD: LazyLock<Regex> = LazyLock::new(|| {
    pattern(concat!(
        r"^(?:https?://)?soundcloud\.app\.goo\.gl/[a-z\d_-]+/?(?:\?.*)?$|",
        r"^(?:https?://)?(?:www\.)?(?:m\.)?soundcloud\.com/[a-z\d_-]+/[a-z\d_-]+/?(?:\?.*)?$|",
        r"^(?:https?://)?(?:www\.)?(?:m\.)?soundcloud\.com/[a-z\d_-]+/[a-z\d_-]+/s-[a-z\d_-]+(?:\?.*)?$|",
        r"^(?:https?://)?(?:www\.)?(?:m\.)?soundcloud\.com/[a-z\d_-]+/likes/?(?:\?.*)?$|",
        r"^(?:https?://)?(?:www\.)?(?:m\.)?soundcloud\.com/[a-z\d_-]+/[a-z\d_-]+/[a-z\d_-]+(?:\?.*)?$",
    ))
});
static TWITCH: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^https://(?:www\.|go\.)?twitch\.tv/[^/]+$"));
static GOOGLE_TTS: LazyLock<Regex> = LazyLock::new(|| pattern(r"^tts://\s*?(?P<query>.*)$"));
static SPEAK: LazyLock<Regex> = LazyLock::new(|| pattern(r"^speak:\s*?(?P<query>.*)$"));
static CLYPIT: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^(?:http://|https://(?:www\.)?)?clyp\.it/"));
static GETYARN: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^(?:http://|https://(?:www\.)?)?getyarn\.io/yarn-clip/"));
static MIXCLOUD: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"^https?://(?:(?:www|beta|m)\.)?mixcloud\.com/[^/]+/(?P<path>[^/]+)/?")
});
static OCREMIX: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^(?:https?://(?:www\.)?ocremix\.org/remix/)?OCR\d+"));
static PORNHUB: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"^https?://(?:[a-z]+\.)?pornhub\.(?:com|net)/view_video\.php\?viewkey=[a-z\d]+.*$")
});
static REDDIT: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"^(?:https://(?:www|old)\.reddit\.com/r/[^/]+/[^/]+/[^/]+|https://v\.redd\.it/[^/]+)")
});
static SOUNDGASM: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^https?://soundgasm\.net/u/[^/]+/[^/]+"));
static TIKTOK: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"^https://(?:www\.|m\.)?tiktok\.com/@[^/]+/video/\d+.*$")
});
static BANDCAMP: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"^https?://(?:[^.]+\.)?bandcamp\.com/(?:track|album)/[a-z\d_-]+/?(?:\?.*)?$")
});
static NICONICO: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"^(?:https?://)?(?:www\.)?nicovideo\.jp/watch/sm\d+(?:\?.*)?$")
});
static VIMEO: LazyLock<Regex> = LazyLock::new(|| pattern(r"^https://vimeo\.com/\d+(?:\?.*)?$"));
static HTTP: LazyLock<Regex> = LazyLock::new(|| pattern(r"^https?://"));

static SEARCH: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^(?P<source>ytm|yt|sp|sc|am)search:\s*?(?P<query>.*)$"));
static LOCAL_RECURSIVE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^(?:all|nested|recursive|tree):\s*?(?P<query>.*)$"));

static YOUTUBE_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| pattern(r"[&?]t=(\d+)"));
static YOUTUBE_INDEX: LazyLock<Regex> = LazyLock::new(|| pattern(r"&index=(\d+)"));
static SPOTIFY_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| pattern(r"#(\d+):(\d+)"));
static SOUNDCLOUD_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| pattern(r"#t=(\d+):(\d+)"));
static TWITCH_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"\?t=(\d+)h(\d+)m(\d+)s"));

/// Mixcloud sub-pages that list content rather than being content.
const MIXCLOUD_LISTINGS: [&str; 5] = ["stream", "uploads", "favorites", "listens", "playlists"];

/// Sums the captured numbers, each multiplied by its unit in seconds.
fn offset(captures: Option<Captures<'_>>, units: &[u64]) -> Duration {
    let seconds = captures.map_or(0, |captures| {
        units
            .iter()
            .enumerate()
            .filter_map(|(i, unit)| {
                let value: u64 = captures.get(i + 1)?.as_str().parse().ok()?;
                Some(value.saturating_mul(*unit))
            })
            .fold(0_u64, u64::saturating_add)
    });

    Duration::from_secs(seconds)
}

fn youtube(input: &str, music: bool) -> Query {
    let source = if music {
        Source::YouTubeMusic
    } else {
        Source::YouTube
    };
    let start_time = offset(YOUTUBE_TIMESTAMP.captures(input), &[1]);

    let has_index = input.contains("&index=");
    let mut index = YOUTUBE_INDEX
        .captures(input)
        .and_then(|captures| captures[1].parse::<usize>().ok())
        .map_or(0, |index| index.saturating_sub(1));

    let kind = if input.contains("&list=") && input.contains("watch?") {
        index = 0;
        QueryType::Playlist
    } else if input.contains("playlist?") {
        QueryType::Playlist
    } else if input.contains("list=") {
        index = 0;
        if has_index {
            QueryType::Single
        } else {
            QueryType::Playlist
        }
    } else {
        QueryType::Single
    };

    Query {
        index,
        ..Query::link(input, source)
            .of_kind(kind)
            .starting_at(start_time)
    }
}

fn spotify(input: &str) -> Query {
    let kind = if input.contains("/playlist/") {
        QueryType::Playlist
    } else if input.contains("/album/") {
        QueryType::Album
    } else {
        QueryType::Single
    };

    Query::link(input, Source::Spotify)
        .of_kind(kind)
        .starting_at(offset(SPOTIFY_TIMESTAMP.captures(input), &[60, 1]))
}

fn soundcloud(input: &str) -> Query {
    let kind = if input.contains("/sets/") && !input.contains("?in=") {
        QueryType::Playlist
    } else {
        QueryType::Single
    };

    Query::link(input, Source::SoundCloud)
        .of_kind(kind)
        .starting_at(offset(SOUNDCLOUD_TIMESTAMP.captures(input), &[60, 1]))
}

fn bandcamp(input: &str) -> Query {
    let kind = if input.contains("/album/") {
        QueryType::Album
    } else {
        QueryType::Single
    };

    Query::link(input, Source::Bandcamp).of_kind(kind)
}

fn mixcloud(input: &str) -> Option<Query> {
    let captures = MIXCLOUD.captures(input)?;
    let path = captures["path"].to_lowercase();
    if MIXCLOUD_LISTINGS
        .iter()
        .any(|listing| path.starts_with(listing))
    {
        return None;
    }

    Some(Query::link(input, Source::Mixcloud))
}

/// Matches provider links and text-to-speech directives.
fn classify_link(input: &str) -> Option<Query> {
    if let Some(captures) = YOUTUBE.captures(input) {
        return Some(youtube(input, captures.name("music").is_some()));
    }

    if SPOTIFY.is_match(input) {
        return Some(spotify(input));
    }

    if APPLE_MUSIC.is_match(input) {
        return Some(Query::link(input, Source::AppleMusic));
    }

    if SOUNDCLOUD.is_match(input) {
        return Some(soundcloud(input));
    }

    if TWITCH.is_match(input) {
        return Some(
            Query::link(input, Source::Twitch)
                .starting_at(offset(TWITCH_TIMESTAMP.captures(input), &[3600, 60, 1])),
        );
    }

    if let Some(captures) = GOOGLE_TTS.captures(input) {
        return Some(Query::search(captures["query"].trim(), Source::GoogleTts));
    }

    if let Some(captures) = SPEAK.captures(input) {
        return Some(Query::search(captures["query"].trim(), Source::Speak));
    }

    if CLYPIT.is_match(input) {
        return Some(Query::link(input, Source::ClypIt));
    }

    if GETYARN.is_match(input) {
        return Some(Query::link(input, Source::GetYarn));
    }

    if let Some(query) = mixcloud(input) {
        return Some(query);
    }

    let source = if OCREMIX.is_match(input) {
        Source::OcRemix
    } else if PORNHUB.is_match(input) {
        Source::Pornhub
    } else if REDDIT.is_match(input) {
        Source::Reddit
    } else if SOUNDGASM.is_match(input) {
        Source::SoundGasm
    } else if TIKTOK.is_match(input) {
        Source::TikTok
    } else if BANDCAMP.is_match(input) {
        return Some(bandcamp(input));
    } else if NICONICO.is_match(input) {
        Source::Niconico
    } else if VIMEO.is_match(input) {
        Source::Vimeo
    } else if HTTP.is_match(input) {
        Source::Http
    } else {
        return None;
    };

    Some(Query::link(input, source))
}

/// Classifies user input into queries.
#[derive(Clone)]
pub struct Classifier {
    config: ClassifierConfig,
    resolver: Arc<dyn LocalFileResolver>,
}

impl Classifier {
    #[must_use]
    pub fn new(config: ClassifierConfig, resolver: Arc<dyn LocalFileResolver>) -> Self {
        Self { config, resolver }
    }

    /// Creates a classifier that resolves paths on the local filesystem.
    #[must_use]
    pub fn with_fs(config: ClassifierConfig) -> Self {
        Self::new(config, Arc::new(FsResolver))
    }

    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn fallback(&self, text: &str) -> Query {
        Query::search(text, self.config.fallback_search)
    }

    fn classify_search(&self, input: &str) -> Option<Query> {
        let captures = SEARCH.captures(input)?;
        let text = captures["query"].trim();

        // The pattern matches any case, but only the lowercase spellings
        // select a source.
        let source = match &captures["source"] {
            "ytm" => Source::YouTubeMusic,
            "yt" => Source::YouTube,
            "sp" => Source::Spotify,
            "sc" => Source::SoundCloud,
            "am" => Source::AppleMusic,
            _ => self.config.fallback_search,
        };

        Some(Query::search(text, source))
    }

    /// Classifies input without touching the filesystem.
    ///
    /// Anything that is not a link or a search directive becomes a search on
    /// the fallback source.
    #[must_use]
    pub fn classify_offline(&self, input: &str) -> Query {
        classify_link(input)
            .or_else(|| self.classify_search(input))
            .unwrap_or_else(|| self.fallback(input))
    }

    /// Classifies input. Never fails: input that cannot be classified any
    /// other way is searched for on the fallback source.
    pub async fn classify(&self, input: &str) -> Query {
        if let Some(query) = classify_link(input).or_else(|| self.classify_search(input)) {
            return query;
        }

        match self.classify_local(input).await {
            Ok(query) => query,
            Err(e) => {
                trace!("{input} is not a local path: {e}");
                self.fallback(input)
            }
        }
    }

    /// Classifies a path, falling back to a search for its text when it
    /// cannot be resolved.
    pub async fn classify_path(&self, path: &Path) -> Query {
        let text = path.to_string_lossy();
        match self.classify_local(&text).await {
            Ok(query) => query,
            Err(e) => {
                debug!("{e}");
                self.fallback(&text)
            }
        }
    }

    /// Resolves input as a local file or folder.
    ///
    /// Input may be prefixed with `all:`, `nested:`, `recursive:` or `tree:`
    /// to walk folders recursively. Paths that do not exist as given are
    /// looked up under the local root, with any root component stripped.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the path exists neither as given nor under the
    /// local root.
    pub async fn classify_local(&self, input: &str) -> Result<Query> {
        let (recursive, text) = match LOCAL_RECURSIVE.captures(input) {
            Some(captures) => (true, captures.name("query").map_or("", |m| m.as_str().trim())),
            None => (false, input),
        };

        let mut path = PathBuf::from(text);
        if !self.resolver.exists(&path).await {
            let root = self.config.local_root.as_deref().ok_or_else(|| {
                Error::not_found(format!("{} does not exist", path.display()))
            })?;

            let relative: PathBuf = path
                .components()
                .filter(|component| !matches!(component, Component::Prefix(_) | Component::RootDir))
                .collect();
            path = root.join(relative);

            if !self.resolver.exists(&path).await {
                return Err(Error::not_found(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
        }

        let path = self.resolver.canonicalize(&path).await?;
        let is_dir = self.resolver.is_dir(&path).await;
        let kind = if is_dir {
            QueryType::Album
        } else {
            QueryType::Single
        };

        Ok(Query {
            value: QueryValue::Local(LocalPath { path, is_dir }),
            recursive,
            ..Query::link(text, Source::Local).of_kind(kind)
        })
    }

    /// Reconstructs the query a decoded track was loaded from.
    ///
    /// The link is classified again, but the source always follows the
    /// source manager the node reported.
    #[must_use]
    pub fn from_track(&self, info: &TrackInfo) -> Query {
        let text = info.uri.as_deref().unwrap_or(&info.identifier);
        let mut query = classify_link(text).unwrap_or_else(|| Query::link(text, Source::Http));
        query.source = Source::from_source_name(&info.source_name);
        query
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
