//! Show identification
//!
//! The show is named on the command line as `slug-episode` (e.g. `fnt-192`).
//! File sinks use the whole name; webhooks want the two parts separately.

use std::fmt;

use tracing::warn;

/// Show being broadcast this session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Show {
    name: String,
    slug: String,
    episode: String,
}

impl Show {
    /// Parse a `slug-episode` show name
    ///
    /// A name without a `-` still works for file names, but the slug and
    /// episode fall back to `default` and `1`.
    pub fn parse(name: &str) -> Self {
        let mut parts = name.split('-');
        let (slug, episode) = match (parts.next(), parts.next()) {
            (Some(slug), Some(episode)) => (slug.to_string(), episode.to_string()),
            _ => {
                warn!(
                    show = name,
                    "Show name not in the form slug-episode, using default slug and episode"
                );
                ("default".to_string(), "1".to_string())
            }
        };
        Self {
            name: name.to_string(),
            slug,
            episode,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn episode(&self) -> &str {
        &self.episode
    }
}

impl fmt::Display for Show {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
