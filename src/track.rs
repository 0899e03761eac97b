//! Tracks as exchanged with a node.
//!
//! A [`Track`] is the opaque base64 string the node hands out plus the
//! metadata decoded from it. The encoded string is what gets sent back to the
//! node; the decoded [`TrackInfo`] is what everything else looks at.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::{
    error::Result,
    protocol::codec,
    query::{Classifier, Query},
};

/// Audio source managers a node can report in a track's `sourceName`.
///
/// Unrecognized names are kept verbatim in [`SourceName::Other`] so that
/// decoding never depends on this list being complete.
#[derive(Clone, Debug, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub enum SourceName {
    Youtube,
    Soundcloud,
    Bandcamp,
    Twitch,
    Vimeo,
    Local,
    Http,
    GetYarn,
    ClypIt,
    Speak,
    Pornhub,
    Reddit,
    OcRemix,
    TikTok,
    Mixcloud,
    SoundGasm,
    Spotify,
    AppleMusic,
    Deezer,
    YandexMusic,
    GoogleTts,
    Niconico,
    Other(String),
}

impl SourceName {
    const YOUTUBE: &str = "youtube";
    const SOUNDCLOUD: &str = "soundcloud";
    const BANDCAMP: &str = "bandcamp";
    const TWITCH: &str = "twitch";
    const VIMEO: &str = "vimeo";
    const LOCAL: &str = "local";
    const HTTP: &str = "http";
    const GETYARN: &str = "getyarn.io";
    const CLYPIT: &str = "clypit";
    const SPEAK: &str = "speak";
    const PORNHUB: &str = "pornhub";
    const REDDIT: &str = "reddit";
    const OCREMIX: &str = "ocremix";
    const TIKTOK: &str = "tiktok";
    const MIXCLOUD: &str = "mixcloud";
    const SOUNDGASM: &str = "soundgasm";
    const SPOTIFY: &str = "spotify";
    const APPLE_MUSIC: &str = "applemusic";
    const DEEZER: &str = "deezer";
    const YANDEX_MUSIC: &str = "yandexmusic";
    const GOOGLE_TTS: &str = "gcloud-tts";
    const NICONICO: &str = "niconico";

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Youtube => Self::YOUTUBE,
            Self::Soundcloud => Self::SOUNDCLOUD,
            Self::Bandcamp => Self::BANDCAMP,
            Self::Twitch => Self::TWITCH,
            Self::Vimeo => Self::VIMEO,
            Self::Local => Self::LOCAL,
            Self::Http => Self::HTTP,
            Self::GetYarn => Self::GETYARN,
            Self::ClypIt => Self::CLYPIT,
            Self::Speak => Self::SPEAK,
            Self::Pornhub => Self::PORNHUB,
            Self::Reddit => Self::REDDIT,
            Self::OcRemix => Self::OCREMIX,
            Self::TikTok => Self::TIKTOK,
            Self::Mixcloud => Self::MIXCLOUD,
            Self::SoundGasm => Self::SOUNDGASM,
            Self::Spotify => Self::SPOTIFY,
            Self::AppleMusic => Self::APPLE_MUSIC,
            Self::Deezer => Self::DEEZER,
            Self::YandexMusic => Self::YANDEX_MUSIC,
            Self::GoogleTts => Self::GOOGLE_TTS,
            Self::Niconico => Self::NICONICO,
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceName {
    type Err = std::convert::Infallible;

    /// Parses a source name as reported by the node. Never fails.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let variant = match s {
            Self::YOUTUBE => Self::Youtube,
            Self::SOUNDCLOUD => Self::Soundcloud,
            Self::BANDCAMP => Self::Bandcamp,
            Self::TWITCH => Self::Twitch,
            Self::VIMEO => Self::Vimeo,
            Self::LOCAL => Self::Local,
            Self::HTTP => Self::Http,
            // Older plugin builds report the name without the TLD.
            Self::GETYARN | "getyarn" => Self::GetYarn,
            Self::CLYPIT => Self::ClypIt,
            Self::SPEAK => Self::Speak,
            Self::PORNHUB => Self::Pornhub,
            Self::REDDIT => Self::Reddit,
            Self::OCREMIX => Self::OcRemix,
            Self::TIKTOK => Self::TikTok,
            Self::MIXCLOUD => Self::Mixcloud,
            Self::SOUNDGASM => Self::SoundGasm,
            Self::SPOTIFY => Self::Spotify,
            Self::APPLE_MUSIC => Self::AppleMusic,
            Self::DEEZER => Self::Deezer,
            Self::YANDEX_MUSIC => Self::YandexMusic,
            Self::GOOGLE_TTS => Self::GoogleTts,
            Self::NICONICO => Self::Niconico,
            other => Self::Other(other.to_owned()),
        };

        Ok(variant)
    }
}

/// Metadata decoded from an encoded track.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub title: String,
    pub author: String,
    /// Length in milliseconds.
    pub length: u64,
    pub identifier: String,
    pub is_stream: bool,
    pub uri: Option<String>,
    pub is_seekable: bool,
    pub source_name: SourceName,
    /// Playback position in milliseconds; always zero on a fresh decode.
    pub position: u64,
    #[serde(alias = "artworkUrl")]
    pub thumbnail: Option<String>,
    pub isrc: Option<String>,
    pub probe_info: Option<String>,
}

impl TrackInfo {
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.length)
    }
}

/// A track as known to a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Track {
    encoded: String,
    info: TrackInfo,

    /// The query this track is routed by, if it was classified.
    #[serde(skip)]
    query: Option<Query>,
}

impl Track {
    /// Creates a track from parts that are known to belong together.
    #[must_use]
    pub fn new(encoded: String, info: TrackInfo) -> Self {
        Self {
            encoded,
            info,
            query: None,
        }
    }

    /// Decodes `encoded` on a blocking worker.
    ///
    /// # Errors
    ///
    /// Returns an error when the mandatory fields cannot be decoded.
    pub async fn decode(encoded: &str) -> Result<Self> {
        let decoded = codec::decode_async(encoded).await?;
        Ok(Self::new(encoded.to_owned(), decoded.info))
    }

    /// Decodes `encoded` and reclassifies the query it routes by.
    ///
    /// # Errors
    ///
    /// Returns an error when the mandatory fields cannot be decoded.
    pub async fn from_encoded(encoded: &str, classifier: &Classifier) -> Result<Self> {
        let mut track = Self::decode(encoded).await?;
        track.query = Some(classifier.from_track(&track.info));
        Ok(track)
    }

    #[must_use]
    pub fn with_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    #[must_use]
    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    #[must_use]
    pub fn query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.info.title
    }

    #[must_use]
    pub fn author(&self) -> &str {
        &self.info.author
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.info.duration()
    }

    /// Whether `encoded` is the wire representation of this very track.
    #[must_use]
    pub fn is_encoded_as(&self, encoded: &str) -> bool {
        self.encoded == encoded
    }
}

/// Tracks are the same track when their wire representation is.
impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for Track {}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.info.author, self.info.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_names_round_trip_through_strings() {
        for name in ["youtube", "applemusic", "gcloud-tts", "getyarn.io"] {
            let parsed: SourceName = name.parse().unwrap();
            assert!(!matches!(parsed, SourceName::Other(_)), "{name}");
            assert_eq!(parsed.to_string(), name);
        }
    }

    #[test]
    fn unknown_source_names_are_preserved() {
        let parsed: SourceName = "jiosaavn".parse().unwrap();
        assert_eq!(parsed, SourceName::Other("jiosaavn".to_owned()));
        assert_eq!(parsed.as_str(), "jiosaavn");
    }

    #[test]
    fn legacy_getyarn_name_is_recognized() {
        assert_eq!("getyarn".parse::<SourceName>().unwrap(), SourceName::GetYarn);
    }
}
