//! Classify the location a session was launched from.
//!
//! Recognised forms (query and fragment of a share URL, or the bare
//! fragment):
//! - `#room=<roomId>,<roomKey>`: live collaboration room
//! - `#json=<id>,<key>`: stored share link
//! - `?id=<id>`: share link from the keyless legacy backend
//! - `#url=<percent-encoded url>`: scene file hosted elsewhere
//!
//! Anything else opens the local scene.

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocatorError {
    #[error("Malformed {0} fragment")]
    MalformedFragment(&'static str),
    #[error("Invalid percent-encoding in url fragment: {0}")]
    InvalidEncoding(String),
    #[error("Unrecognised scene link: {0}")]
    Unrecognised(String),
}

pub type Result<T> = std::result::Result<T, LocatorError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneLocator {
    Local,
    ShareLink { id: String, key: String },
    CollabRoom { room_id: String, room_key: String },
    ExternalUrl(String),
    LegacyId(String),
}

impl SceneLocator {
    /// Classify `link`, falling back to `Local` for anything malformed.
    pub fn parse(link: &str) -> Self {
        match Self::parse_strict(link) {
            Ok(locator) => locator,
            Err(LocatorError::Unrecognised(_)) => SceneLocator::Local,
            Err(e) => {
                debug!("Ignoring scene link: {}", e);
                SceneLocator::Local
            }
        }
    }

    /// Classify `link`, reporting why it is not a recognised scene link.
    pub fn parse_strict(link: &str) -> Result<Self> {
        let (before, fragment) = match link.split_once('#') {
            Some((before, fragment)) => (before, Some(fragment)),
            None => (link, None),
        };

        if let Some(fragment) = fragment {
            if let Some(rest) = fragment.strip_prefix("room=") {
                let (room_id, room_key) = id_key_pair(rest).ok_or(LocatorError::MalformedFragment("room"))?;
                return Ok(SceneLocator::CollabRoom { room_id, room_key });
            }
            if let Some(rest) = fragment.strip_prefix("json=") {
                let (id, key) = id_key_pair(rest).ok_or(LocatorError::MalformedFragment("json"))?;
                return Ok(SceneLocator::ShareLink { id, key });
            }
        }

        if let Some(id) = query_param(before, "id") {
            return if is_segment(id) {
                Ok(SceneLocator::LegacyId(id.to_string()))
            } else {
                Err(LocatorError::MalformedFragment("id"))
            };
        }

        if let Some(encoded) = fragment.and_then(|f| f.strip_prefix("url=")) {
            if encoded.is_empty() {
                return Err(LocatorError::MalformedFragment("url"));
            }
            let decoded = urlencoding::decode(encoded)
                .map_err(|e| LocatorError::InvalidEncoding(e.to_string()))?;
            return Ok(SceneLocator::ExternalUrl(decoded.into_owned()));
        }

        Err(LocatorError::Unrecognised(link.to_string()))
    }

    /// A live collaboration room: no local-storage writes of peer state,
    /// no cross-replica staleness checks.
    pub fn is_collaborative(&self) -> bool {
        matches!(self, SceneLocator::CollabRoom { .. })
    }

    /// Remote container holding this scene's assets, with its access key.
    pub fn file_container(&self) -> Option<(String, String)> {
        match self {
            SceneLocator::ShareLink { id, key } => Some((format!("files/shareLinks/{}", id), key.clone())),
            SceneLocator::CollabRoom { room_id, room_key } => {
                Some((format!("files/rooms/{}", room_id), room_key.clone()))
            }
            _ => None,
        }
    }
}

fn is_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn id_key_pair(s: &str) -> Option<(String, String)> {
    let (id, key) = s.split_once(',')?;
    (is_segment(id) && is_segment(key)).then(|| (id.to_string(), key.to_string()))
}

fn query_param<'a>(before_fragment: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = before_fragment.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}
