use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tidings_shared::error::FileTransferError;
use tidings_shared::protocol::{ChannelDescriptor, ChannelRequest, FileTransferProperties};
use tidings_shared::types::{
    AccountId, ChannelPath, ChannelType, ConnectionId, ContentHashType, Handle, HandleType,
    TransferId, TransferState, TransferStateReason,
};

use super::checksum::{hash_file, HashError};
use super::progress::ProgressSampler;
use super::{TransferCompletion, TransferDirection, TransferPhase};
use crate::context::{Completion, Context, RequestOrigin};
use crate::error::{DispatcherError, Result};
use crate::events::{DispatcherEvent, TransferInfo};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub struct FileTransferHandler {
    id: TransferId,
    account: AccountId,
    connection: ConnectionId,
    direction: TransferDirection,
    contact: Handle,
    channel: Option<ChannelPath>,
    /// Source file when outgoing, destination when incoming.
    file: Option<PathBuf>,
    properties: Option<FileTransferProperties>,
    phase: TransferPhase,
    hash_type: ContentHashType,
    use_hash: bool,
    token: CancellationToken,
    sampler: Option<ProgressSampler>,
    transferred: u64,
    error: Option<FileTransferError>,
}

impl FileTransferHandler {
    /// Send `source` to `contact`, hashing it with `hash_type` first.
    pub fn outgoing(
        account: AccountId,
        connection: ConnectionId,
        contact: Handle,
        source: PathBuf,
        hash_type: ContentHashType,
    ) -> Self {
        Self {
            id: TransferId::new(),
            account,
            connection,
            direction: TransferDirection::Outgoing,
            contact,
            channel: None,
            file: Some(source),
            properties: None,
            phase: TransferPhase::Preparing,
            hash_type,
            use_hash: hash_type != ContentHashType::None,
            token: CancellationToken::new(),
            sampler: None,
            transferred: 0,
            error: None,
        }
    }

    /// Receive the file offered on `descriptor`.
    pub fn incoming(account: AccountId, connection: ConnectionId, descriptor: &ChannelDescriptor) -> Self {
        Self {
            id: TransferId::new(),
            account,
            connection,
            direction: TransferDirection::Incoming,
            contact: descriptor.handle,
            channel: Some(descriptor.path.clone()),
            file: None,
            properties: None,
            phase: TransferPhase::Preparing,
            hash_type: ContentHashType::None,
            use_hash: false,
            token: CancellationToken::new(),
            sampler: None,
            transferred: 0,
            error: None,
        }
    }

    /// Start the preparation step: inspect the source or fetch the offer.
    pub fn prepare(&mut self, ctx: &mut Context) {
        let id = self.id;
        match self.direction {
            TransferDirection::Outgoing => {
                let Some(source) = self.file.clone() else {
                    return;
                };
                ctx.spawn(async move {
                    Completion::Transfer {
                        transfer: id,
                        completion: TransferCompletion::Inspected(inspect_source(source).await),
                    }
                });
            }
            TransferDirection::Incoming => {
                let Some(channel) = self.channel.clone() else {
                    return;
                };
                let transport = ctx.transport();
                ctx.spawn(async move {
                    let result = transport.get_file_properties(&channel).await;
                    Completion::Transfer {
                        transfer: id,
                        completion: TransferCompletion::PropertiesFetched(result),
                    }
                });
                ctx.request_contacts(&self.connection, &[self.contact]);
            }
        }
    }

    // -- Accessors --

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn channel(&self) -> Option<&ChannelPath> {
        self.channel.as_ref()
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn properties(&self) -> Option<&FileTransferProperties> {
        self.properties.as_ref()
    }

    pub fn error(&self) -> Option<&FileTransferError> {
        self.error.as_ref()
    }

    pub fn is_hashing_enabled(&self) -> bool {
        self.use_hash
    }

    /// Preparation is over, successfully or not.
    pub fn is_ready(&self) -> bool {
        self.phase != TransferPhase::Preparing
    }

    pub fn info(&self) -> TransferInfo {
        let props = self.properties.as_ref();
        TransferInfo {
            id: self.id,
            account: self.account.clone(),
            direction: self.direction,
            contact: self.contact,
            filename: props.map(|p| p.filename.clone()).unwrap_or_default(),
            content_type: props
                .map(|p| p.content_type.clone())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            size: props.map(|p| p.size).unwrap_or(0),
            description: props.and_then(|p| p.description.clone()),
        }
    }

    // -- Commands --

    /// Choose where an incoming file is written. Hashing is only honoured
    /// when the sender provided a hash.
    pub fn set_destination(&mut self, path: PathBuf, use_hash: bool) -> Result<()> {
        if self.direction != TransferDirection::Incoming || self.phase != TransferPhase::Ready {
            return Err(DispatcherError::InvalidState(format!(
                "transfer {} cannot take a destination in phase {:?}",
                self.id, self.phase
            )));
        }

        let has_hash = self
            .properties
            .as_ref()
            .map(|p| p.content_hash.is_some() && p.content_hash_type != ContentHashType::None)
            .unwrap_or(false);
        if use_hash && !has_hash {
            debug!(transfer = %self.id, "Sender gave no hash, verification disabled");
        }
        self.use_hash = use_hash && has_hash;
        self.file = Some(path);
        Ok(())
    }

    /// Accept an incoming file into the chosen destination.
    pub fn start(&mut self, ctx: &mut Context) -> Result<()> {
        let (Some(channel), Some(destination)) = (self.channel.clone(), self.file.clone()) else {
            return Err(DispatcherError::InvalidState(format!(
                "transfer {} has no destination",
                self.id
            )));
        };
        if self.direction != TransferDirection::Incoming || self.phase != TransferPhase::Ready {
            return Err(DispatcherError::InvalidState(format!(
                "transfer {} cannot start in phase {:?}",
                self.id, self.phase
            )));
        }

        info!(transfer = %self.id, destination = %destination.display(), "Accepting file");
        let transport = ctx.transport();
        let id = self.id;
        ctx.spawn(async move {
            let result = transport.accept_file(&channel, &destination, 0).await;
            Completion::Transfer {
                transfer: id,
                completion: TransferCompletion::Started(result),
            }
        });
        Ok(())
    }

    /// Cancel the transfer. Returns `false` once it already ended.
    pub fn cancel(&mut self, ctx: &mut Context) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        info!(transfer = %self.id, phase = ?self.phase, "Cancelling transfer");
        self.token.cancel();

        if self.phase != TransferPhase::Hashing {
            if let Some(channel) = self.channel.clone() {
                let transport = ctx.transport();
                ctx.spawn_logged("cancel_file", channel.clone(), async move {
                    transport.cancel_file(&channel).await
                });
            }
        }

        self.phase = TransferPhase::Cancelled;
        ctx.events
            .emit(DispatcherEvent::TransferCancelled { transfer: self.id });
        true
    }

    // -- Inbound --

    pub fn on_completion(&mut self, completion: TransferCompletion, ctx: &mut Context) {
        if self.phase.is_terminal() {
            debug!(transfer = %self.id, phase = ?self.phase, "Discarding completion for finished transfer");
            return;
        }

        match completion {
            TransferCompletion::Inspected(Ok((source, props))) => {
                debug!(transfer = %self.id, size = props.size, content_type = %props.content_type, "Source inspected");
                self.properties = Some(props);
                if self.use_hash {
                    self.start_hashing(source, ctx);
                } else {
                    self.request_channel(ctx);
                }
            }
            TransferCompletion::Inspected(Err(e)) => self.fail(e, ctx),

            TransferCompletion::PropertiesFetched(Ok(props)) => {
                self.hash_type = props.content_hash_type;
                self.properties = Some(props);
                self.check_ready(ctx);
            }
            TransferCompletion::PropertiesFetched(Err(e)) => self.fail(e.into(), ctx),

            TransferCompletion::Hashed(result) => self.on_hashed(result, ctx),

            TransferCompletion::Started(Ok(())) => {
                debug!(transfer = %self.id, "Transport took the file");
            }
            TransferCompletion::Started(Err(e)) => self.fail(e.into(), ctx),
        }
    }

    pub fn on_contacts_resolved(&mut self, ctx: &mut Context) {
        self.check_ready(ctx);
    }

    /// The channel for an outgoing transfer exists: offer the file on it.
    pub fn on_channel_ready(&mut self, channel: ChannelPath, ctx: &mut Context) {
        if self.phase.is_terminal() {
            debug!(transfer = %self.id, channel = %channel, "Closing channel of finished transfer");
            let transport = ctx.transport();
            ctx.spawn_logged("close_channel", channel.clone(), async move {
                transport.close_channel(&channel).await
            });
            return;
        }
        let Some(source) = self.file.clone() else {
            return;
        };
        debug!(transfer = %self.id, channel = %channel, "Offering file");
        self.channel = Some(channel.clone());
        self.phase = TransferPhase::Ready;
        ctx.events.emit(DispatcherEvent::TransferReady(self.info()));

        let transport = ctx.transport();
        let id = self.id;
        ctx.spawn(async move {
            let result = transport.offer_file(&channel, &source).await;
            Completion::Transfer {
                transfer: id,
                completion: TransferCompletion::Started(result),
            }
        });
    }

    pub fn on_request_failed(&mut self, error: FileTransferError, ctx: &mut Context) {
        self.fail(error, ctx);
    }

    pub fn on_state_changed(&mut self, state: TransferState, reason: TransferStateReason, ctx: &mut Context) {
        if self.phase.is_terminal() {
            return;
        }
        debug!(transfer = %self.id, state = ?state, reason = ?reason, "Transfer state changed");

        match state {
            TransferState::Open => {
                if matches!(self.phase, TransferPhase::Preparing | TransferPhase::Ready) {
                    self.phase = TransferPhase::Transferring;
                    self.transferred = 0;
                    self.restart_sampler(Instant::now());
                    ctx.events
                        .emit(DispatcherEvent::TransferStarted { transfer: self.id });
                }
            }
            TransferState::Completed => {
                let verify = self.direction == TransferDirection::Incoming && self.use_hash;
                match (verify, self.file.clone()) {
                    (true, Some(destination)) => self.start_hashing(destination, ctx),
                    _ => self.finish(ctx),
                }
            }
            TransferState::Cancelled => match reason {
                TransferStateReason::Requested | TransferStateReason::LocalStopped => {
                    self.token.cancel();
                    self.phase = TransferPhase::Cancelled;
                    ctx.events
                        .emit(DispatcherEvent::TransferCancelled { transfer: self.id });
                }
                TransferStateReason::RemoteStopped => self.fail(
                    FileTransferError::Failed("The remote contact stopped the transfer".into()),
                    ctx,
                ),
                TransferStateReason::LocalError => {
                    self.fail(FileTransferError::Failed("Local error".into()), ctx)
                }
                TransferStateReason::RemoteError | TransferStateReason::None => {
                    self.fail(FileTransferError::Failed("Remote error".into()), ctx)
                }
            },
            TransferState::None | TransferState::Pending | TransferState::Accepted => {}
        }
    }

    pub fn on_transferred_bytes(&mut self, bytes: u64, ctx: &mut Context) {
        if self.phase != TransferPhase::Transferring {
            return;
        }
        let now = Instant::now();
        // Timing starts over at the first empty progress report.
        if bytes == 0 {
            self.restart_sampler(now);
        }
        if bytes == self.transferred {
            return;
        }
        self.transferred = bytes;

        let Some(sampler) = self.sampler.as_mut() else {
            return;
        };
        let (estimate, _) = sampler.sample(bytes, now);
        ctx.events.emit(DispatcherEvent::TransferProgress {
            transfer: self.id,
            transferred: estimate.transferred,
            total: estimate.total,
            speed: estimate.speed,
            remaining_secs: estimate.remaining_secs,
        });
    }

    pub fn on_channel_closed(&mut self, ctx: &mut Context) {
        self.channel = None;
        // A received file being verified no longer needs its channel.
        if self.phase.is_terminal() || self.phase == TransferPhase::Hashing {
            return;
        }
        self.fail(FileTransferError::Failed("The channel was closed".into()), ctx);
    }

    // -- Internals --

    fn check_ready(&mut self, ctx: &mut Context) {
        if self.direction != TransferDirection::Incoming || self.phase != TransferPhase::Preparing {
            return;
        }
        if self.properties.is_none() || !ctx.contacts.is_resolved(&self.connection, self.contact) {
            return;
        }
        debug!(transfer = %self.id, "Incoming transfer ready");
        self.phase = TransferPhase::Ready;
        ctx.events.emit(DispatcherEvent::TransferReady(self.info()));
    }

    fn restart_sampler(&mut self, now: Instant) {
        let total = self.properties.as_ref().map(|p| p.size).unwrap_or(0);
        let mut sampler = ProgressSampler::new(total);
        sampler.sample(0, now);
        self.sampler = Some(sampler);
    }

    fn start_hashing(&mut self, path: PathBuf, ctx: &mut Context) {
        self.phase = TransferPhase::Hashing;
        ctx.events
            .emit(DispatcherEvent::HashingStarted { transfer: self.id });

        let id = self.id;
        let total = self.properties.as_ref().map(|p| p.size).unwrap_or(0);
        let kind = self.hash_type;
        let token = self.token.clone();
        let events = ctx.events.clone();
        ctx.spawn(async move {
            let result = hash_file(path, kind, token, move |current| {
                events.emit(DispatcherEvent::HashingProgress {
                    transfer: id,
                    current,
                    total,
                })
            })
            .await;
            Completion::Transfer {
                transfer: id,
                completion: TransferCompletion::Hashed(result),
            }
        });
    }

    fn on_hashed(&mut self, result: std::result::Result<String, HashError>, ctx: &mut Context) {
        let digest = match result {
            Ok(digest) => digest,
            Err(HashError::Cancelled) => return,
            Err(e) => {
                self.fail(FileTransferError::Failed(e.to_string()), ctx);
                return;
            }
        };
        ctx.events
            .emit(DispatcherEvent::HashingDone { transfer: self.id });

        match self.direction {
            TransferDirection::Outgoing => {
                if let Some(props) = self.properties.as_mut() {
                    props.content_hash_type = self.hash_type;
                    props.content_hash = Some(digest);
                }
                self.phase = TransferPhase::Preparing;
                self.request_channel(ctx);
            }
            TransferDirection::Incoming => {
                let expected = self
                    .properties
                    .as_ref()
                    .and_then(|p| p.content_hash.clone())
                    .unwrap_or_default();
                if expected.eq_ignore_ascii_case(&digest) {
                    self.finish(ctx);
                } else {
                    self.fail(
                        FileTransferError::HashMismatch {
                            expected,
                            actual: digest,
                        },
                        ctx,
                    );
                }
            }
        }
    }

    fn request_channel(&mut self, ctx: &mut Context) {
        let Some(props) = self.properties.clone() else {
            return;
        };
        debug!(transfer = %self.id, contact = %self.contact, "Requesting file channel");
        let request = ChannelRequest::new(ChannelType::FileTransfer, HandleType::Contact)
            .with_handle(self.contact)
            .with_file(props);
        ctx.push_request(self.account.clone(), request, RequestOrigin::Transfer(self.id));
    }

    fn finish(&mut self, ctx: &mut Context) {
        info!(transfer = %self.id, direction = ?self.direction, "Transfer done");
        self.phase = TransferPhase::Done;
        ctx.events
            .emit(DispatcherEvent::TransferDone { transfer: self.id });
    }

    fn fail(&mut self, error: FileTransferError, ctx: &mut Context) {
        if self.phase.is_terminal() {
            return;
        }
        warn!(transfer = %self.id, error = %error, "Transfer failed");
        self.phase = TransferPhase::Error;
        self.token.cancel();
        ctx.events.emit(DispatcherEvent::TransferError {
            transfer: self.id,
            code: error.code(),
            message: error.to_string(),
        });
        self.error = Some(error);
    }
}

/// Stat an outgoing file and describe it.
async fn inspect_source(
    path: PathBuf,
) -> std::result::Result<(PathBuf, FileTransferProperties), FileTransferError> {
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|e| FileTransferError::InvalidSourceFile(format!("{}: {e}", path.display())))?;
    if !meta.is_file() {
        return Err(FileTransferError::InvalidSourceFile(path.display().to_string()));
    }
    if meta.len() == 0 {
        return Err(FileTransferError::EmptySourceFile);
    }

    let props = FileTransferProperties {
        filename: file_name(&path),
        content_type: mime_guess::from_path(&path)
            .first_raw()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string(),
        size: meta.len(),
        content_hash_type: ContentHashType::None,
        content_hash: None,
        description: None,
        date: meta.modified().ok().map(DateTime::<Utc>::from),
        transferred_bytes: 0,
        state: TransferState::None,
    };
    Ok((path, props))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}
