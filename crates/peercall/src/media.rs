//! Local media capture seam.
//!
//! The coordinator never talks to capture devices. It asks a [`MediaCapture`]
//! for a stream matching some constraints and attaches the resulting track
//! descriptors to the peer connection.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::BoxFuture;

/// Media acquisition errors. Surfaced to the caller, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("constraints request neither audio nor video")]
    NothingRequested,
}

/// Which media kinds to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// A captured local track.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// A captured local stream: the unit handed to the rendering collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

/// A track announced by the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Source of local media streams.
pub trait MediaCapture: Send + Sync {
    fn acquire_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'_, Result<MediaStream, MediaError>>;
}

/// Capture that produces track descriptors without touching a device.
///
/// Samples for the tracks are written by whoever owns the real source, through
/// the engine's local track handles.
#[derive(Debug, Default)]
pub struct SyntheticCapture {
    next_stream: AtomicU64,
    deny: Option<String>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A capture that refuses every request, as a device without permission would.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            next_stream: AtomicU64::new(0),
            deny: Some(reason.into()),
        }
    }
}

impl MediaCapture for SyntheticCapture {
    fn acquire_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'_, Result<MediaStream, MediaError>> {
        Box::pin(async move {
            if let Some(reason) = &self.deny {
                return Err(MediaError::PermissionDenied(reason.clone()));
            }
            if !constraints.video && !constraints.audio {
                return Err(MediaError::NothingRequested);
            }

            let n = self.next_stream.fetch_add(1, Ordering::Relaxed) + 1;
            let stream_id = format!("local-stream-{}", n);
            let mut tracks = Vec::new();
            for (wanted, kind) in [
                (constraints.video, TrackKind::Video),
                (constraints.audio, TrackKind::Audio),
            ] {
                if wanted {
                    tracks.push(MediaTrack {
                        id: format!("{}-{}", stream_id, kind.as_str()),
                        kind,
                        stream_id: stream_id.clone(),
                    });
                }
            }

            tracing::debug!(stream = %stream_id, tracks = tracks.len(), "acquired local media");
            Ok(MediaStream {
                id: stream_id,
                tracks,
            })
        })
    }
}
