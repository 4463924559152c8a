//! Marker value type and marker classification
//!
//! A [`Marker`] is one labelled event at a point in broadcast-relative time.
//! Sources build markers and hand them to the mediator; the mediator stamps
//! the time and fans them out to sinks by [`MarkerType`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Routing key for markers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarkerType {
    /// A song played over the air
    Track,
    /// A topic of conversation, be it an article or otherwise
    Topic,
}

impl MarkerType {
    /// Every marker type, in declaration order
    pub const ALL: [MarkerType; 2] = [MarkerType::Track, MarkerType::Topic];

    /// Parse the fixed-case textual form
    ///
    /// Only `"TRACK"` and `"TOPIC"` are recognised; anything else (including
    /// lowercase spellings) yields `None`. Callers that accept user input
    /// upper-case it first.
    pub fn from_string(s: &str) -> Option<MarkerType> {
        match s {
            "TRACK" => Some(MarkerType::Track),
            "TOPIC" => Some(MarkerType::Topic),
            _ => None,
        }
    }

    /// Textual form used in logs, config and the control shell
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerType::Track => "TRACK",
            MarkerType::Topic => "TOPIC",
        }
    }
}

impl fmt::Display for MarkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarkerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MarkerType::from_string(s)
            .ok_or_else(|| Error::InvalidArgument(format!("invalid marker type: {s:?}")))
    }
}

/// A label at a time
///
/// `time` is seconds since the first marker published through the owning
/// mediator. It stays `None` until the mediator assigns it, and nothing else
/// writes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    label: String,
    /// Artist, when the source could split the label
    pub artist: Option<String>,
    /// Title, when the source could split the label
    pub title: Option<String>,
    time: Option<f64>,
    /// Short annotation attached by the source (e.g. a stream-quality tag)
    pub special: Option<String>,
    /// Link carried through for sinks; unused by the mediator
    pub url: Option<String>,
}

impl Marker {
    /// Create a marker with a label
    ///
    /// # Errors
    /// `InvalidArgument` if the label is empty.
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        if label.is_empty() {
            return Err(Error::InvalidArgument(
                "marker label must not be empty".to_string(),
            ));
        }
        Ok(Self {
            label,
            artist: None,
            title: None,
            time: None,
            special: None,
            url: None,
        })
    }

    /// Create a marker whose label is split into artist and title
    pub fn with_track(
        label: impl Into<String>,
        artist: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self> {
        let mut marker = Self::new(label)?;
        marker.artist = Some(artist.into());
        marker.title = Some(title.into());
        Ok(marker)
    }

    /// Create a marker that already carries a time
    ///
    /// Used when replaying markers outside a mediator, e.g. in sink tests.
    pub fn with_time(label: impl Into<String>, time: f64) -> Result<Self> {
        let mut marker = Self::new(label)?;
        marker.time = Some(time);
        Ok(marker)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Seconds since the first published marker, once published
    pub fn time(&self) -> Option<f64> {
        self.time
    }

    pub(crate) fn assign_time(&mut self, time: f64) {
        self.time = Some(time);
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)?;
        if let Some(special) = &self.special {
            write!(f, " ({special})")?;
        }
        Ok(())
    }
}
