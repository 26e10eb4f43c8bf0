//! Ownership of the single peer connection.
//!
//! [`ConnectionManager`] creates the connection lazily, hands it an event
//! sink stamped with a fresh epoch, and tears it down on request. Events
//! carrying an epoch other than the current one belong to a connection that
//! no longer exists and must be ignored by the caller.

use std::future::Future;

use protocol::SdpType;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CallError, CallResult, NegotiationStep};
use crate::media::MediaTrack;
use crate::network::{
    ConnectionEvent, ConnectionState, EngineConnection, EngineError, EngineEventSink, IceConfig,
    PeerEngine,
};

/// The live peer connection and what the coordinator knows about it.
pub struct PeerConnection<C: EngineConnection> {
    epoch: u64,
    handle: C,
    pub(crate) local_description: Option<SdpType>,
    pub(crate) remote_description: Option<SdpType>,
    pub(crate) state: ConnectionState,
    local_tracks: Vec<MediaTrack>,
    pub(crate) has_data_channel: bool,
    cancel: CancellationToken,
}

impl<C: EngineConnection> PeerConnection<C> {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn handle(&self) -> &C {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_description(&self) -> Option<SdpType> {
        self.local_description
    }

    pub fn remote_description(&self) -> Option<SdpType> {
        self.remote_description
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description.is_some()
    }

    /// Whether remote candidates may be applied right away.
    pub fn remote_settled(&self) -> bool {
        self.remote_description.is_some_and(SdpType::is_settled)
    }

    pub fn local_tracks(&self) -> &[MediaTrack] {
        &self.local_tracks
    }

    pub fn has_data_channel(&self) -> bool {
        self.has_data_channel
    }

    /// Runs `fut` unless the connection is closed first.
    pub async fn until_closed<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            output = fut => Some(output),
        }
    }

    /// Runs an engine step, mapping its failure to a negotiation error.
    pub async fn guarded<T, F>(&self, step: NegotiationStep, fut: F) -> CallResult<T>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        match self.until_closed(fut).await {
            Some(result) => result.map_err(|e| CallError::negotiation(step, e)),
            None => Err(CallError::Cancelled(step)),
        }
    }

    async fn attach(&mut self, track: MediaTrack) -> CallResult<()> {
        if self.local_tracks.iter().any(|t| t.id == track.id) {
            return Ok(());
        }
        self.handle
            .add_track(track.clone())
            .await
            .map_err(|e| CallError::Engine(format!("failed to add track {}: {}", track.id, e)))?;
        debug!(epoch = self.epoch, track = %track.id, kind = track.kind.as_str(), "attached local track");
        self.local_tracks.push(track);
        Ok(())
    }
}

/// Creates, hands out and closes the coordinator's peer connection.
pub struct ConnectionManager<E: PeerEngine> {
    engine: E,
    ice: IceConfig,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    next_epoch: u64,
    current: Option<PeerConnection<E::Connection>>,
    cancel_tx: watch::Sender<CancellationToken>,
}

impl<E: PeerEngine> ConnectionManager<E> {
    pub fn new(
        engine: E,
        ice: IceConfig,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(CancellationToken::new());
        Self {
            engine,
            ice,
            events_tx,
            next_epoch: 0,
            current: None,
            cancel_tx,
        }
    }

    /// Publishes the cancellation token of whichever connection is current.
    pub fn cancel_watch(&self) -> watch::Receiver<CancellationToken> {
        self.cancel_tx.subscribe()
    }

    pub fn current(&self) -> Option<&PeerConnection<E::Connection>> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut PeerConnection<E::Connection>> {
        self.current.as_mut()
    }

    /// Whether `epoch` identifies the live connection.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.current.as_ref().is_some_and(|c| c.epoch == epoch)
    }

    /// Returns the live connection, creating it with `tracks` attached if
    /// there is none.
    ///
    /// Creation is all or nothing: if a track cannot be attached the new
    /// connection is closed again and the error returned.
    pub async fn ensure_connection(
        &mut self,
        tracks: &[MediaTrack],
    ) -> CallResult<&mut PeerConnection<E::Connection>> {
        if self.current.is_none() {
            let created = self.create(tracks).await?;
            self.current = Some(created);
        }
        self.current.as_mut().ok_or(CallError::NoConnection)
    }

    async fn create(&mut self, tracks: &[MediaTrack]) -> CallResult<PeerConnection<E::Connection>> {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let sink = EngineEventSink::new(epoch, self.events_tx.clone());

        let handle = self
            .engine
            .create_connection(self.ice.clone(), sink)
            .await
            .map_err(|e| CallError::Engine(format!("failed to create connection: {}", e)))?;

        let mut connection = PeerConnection {
            epoch,
            handle,
            local_description: None,
            remote_description: None,
            state: ConnectionState::New,
            local_tracks: Vec::new(),
            has_data_channel: false,
            cancel: CancellationToken::new(),
        };

        for track in tracks {
            if let Err(e) = connection.attach(track.clone()).await {
                if let Err(close_err) = connection.handle.close().await {
                    warn!(epoch, error = %close_err, "failed to close half-built connection");
                }
                return Err(e);
            }
        }

        self.cancel_tx.send_replace(connection.cancel.clone());
        info!(epoch, tracks = tracks.len(), "peer connection created");
        Ok(connection)
    }

    /// Adds tracks to the live connection, skipping any already attached.
    /// Does nothing when there is no connection.
    pub async fn attach_tracks(&mut self, tracks: &[MediaTrack]) -> CallResult<()> {
        let Some(connection) = self.current.as_mut() else {
            return Ok(());
        };
        for track in tracks {
            connection.attach(track.clone()).await?;
        }
        Ok(())
    }

    /// Tears down the live connection. Returns its epoch, or `None` if there
    /// was nothing to close.
    pub async fn close(&mut self) -> Option<u64> {
        let connection = self.current.take()?;
        connection.cancel.cancel();

        if let Err(e) = connection.handle.close().await {
            warn!(epoch = connection.epoch, error = %e, "engine failed to close connection");
        }
        info!(
            epoch = connection.epoch,
            tracks = connection.local_tracks.len(),
            "peer connection closed"
        );
        Some(connection.epoch)
    }
}
