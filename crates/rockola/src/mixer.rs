//! The mixer driver and its backends.
//!
//! One vtable-shaped trait covers every audio sink: the RTP transmitter,
//! a PCM pipe into a subprocess, and whatever platform sinks live out of
//! tree. The driver pulls PCM from the playing entry's decoder, applies
//! software volume, and pushes whole frames through the active backend,
//! backing off briefly whenever the device errors so a broken sink cannot
//! busy-loop the server.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tracing::{debug, warn};

use rockoconf::{Api, Config};

use crate::reactor::children::{self, Child, ChildError};
use crate::rtp::{RecipientSet, RtpError, RtpSender};

/// Delay before retrying a backend that reported an error.
pub const DEVICE_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MixerError {
    #[error(transparent)]
    Rtp(#[from] RtpError),
    #[error(transparent)]
    Child(#[from] ChildError),
    #[error("i/o error on audio sink: {0}")]
    Io(#[from] std::io::Error),
    #[error("no audio backend configured")]
    NoBackend,
}

/// The backend vtable. `play` consumes whole frames and reports how many
/// samples it took; `pace` is the scheduling hook that keeps the hot loop
/// cooperative.
#[async_trait(?Send)]
pub trait Backend {
    async fn init(&mut self, config: &Config) -> Result<(), MixerError>;
    async fn activate(&mut self) -> Result<(), MixerError>;
    async fn play(&mut self, samples: &[i16]) -> Result<usize, MixerError>;
    async fn deactivate(&mut self) -> Result<(), MixerError>;
    async fn pace(&mut self) {}
    fn ready(&self) -> bool;
}

/// Device lifecycle as the driver sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Open,
    Error,
}

/// Build the configured backend.
pub fn backend_for(config: &Config, recipients: RecipientSet) -> Result<Box<dyn Backend>, MixerError> {
    match config.api {
        Api::Rtp => Ok(Box::new(RtpBackend::new(recipients))),
        Api::Command => {
            let argv = config
                .speaker_command
                .clone()
                .ok_or(MixerError::NoBackend)?;
            Ok(Box::new(CommandBackend::new(argv)))
        }
        Api::None => Ok(Box::new(NullBackend)),
    }
}

/// Streams PCM to the RTP transmitter. The sender survives deactivation
/// so the timestamp clock stays monotone across tracks and pauses.
pub struct RtpBackend {
    recipients: RecipientSet,
    sender: Option<RtpSender>,
}

impl RtpBackend {
    pub fn new(recipients: RecipientSet) -> Self {
        RtpBackend {
            recipients,
            sender: None,
        }
    }
}

#[async_trait(?Send)]
impl Backend for RtpBackend {
    async fn init(&mut self, config: &Config) -> Result<(), MixerError> {
        self.sender = Some(RtpSender::new(config, self.recipients.clone()).await?);
        Ok(())
    }

    async fn activate(&mut self) -> Result<(), MixerError> {
        let sender = self.sender.as_mut().ok_or(MixerError::NoBackend)?;
        sender.mark_discontinuity();
        Ok(())
    }

    async fn play(&mut self, samples: &[i16]) -> Result<usize, MixerError> {
        let sender = self.sender.as_mut().ok_or(MixerError::NoBackend)?;
        sender.transmit(samples).await?;
        Ok(samples.len())
    }

    async fn deactivate(&mut self) -> Result<(), MixerError> {
        Ok(())
    }

    async fn pace(&mut self) {
        if let Some(sender) = self.sender.as_mut() {
            sender.pace().await;
        }
    }

    fn ready(&self) -> bool {
        self.sender.is_some()
    }
}

/// Pipes native-endian PCM into a subprocess (`speaker_command`). A dead
/// sink is respawned on the next activation.
pub struct CommandBackend {
    argv: Vec<String>,
    child: Option<(Child, ChildStdin)>,
}

impl CommandBackend {
    pub fn new(argv: Vec<String>) -> Self {
        CommandBackend { argv, child: None }
    }
}

#[async_trait(?Send)]
impl Backend for CommandBackend {
    async fn init(&mut self, _config: &Config) -> Result<(), MixerError> {
        Ok(())
    }

    async fn activate(&mut self) -> Result<(), MixerError> {
        if self.child.is_none() {
            let pair = children::spawn_speaker("speaker", &self.argv)?;
            self.child = Some(pair);
        }
        Ok(())
    }

    async fn play(&mut self, samples: &[i16]) -> Result<usize, MixerError> {
        let (_, stdin) = self.child.as_mut().ok_or(MixerError::NoBackend)?;
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            bytes.extend_from_slice(&sample.to_ne_bytes());
        }
        if let Err(e) = stdin.write_all(&bytes).await {
            warn!(error = %e, "speaker subprocess lost, will respawn");
            if let Some((mut child, _)) = self.child.take() {
                child.start_kill();
                let _ = child.wait().await;
            }
            return Err(MixerError::Io(e));
        }
        Ok(samples.len())
    }

    async fn deactivate(&mut self) -> Result<(), MixerError> {
        if let Some((_, stdin)) = self.child.as_mut() {
            let _ = stdin.flush().await;
        }
        Ok(())
    }

    fn ready(&self) -> bool {
        self.child.is_some()
    }
}

/// Swallows PCM at wall-clock speed; used when no sink is configured so
/// queue management still works.
pub struct NullBackend;

#[async_trait(?Send)]
impl Backend for NullBackend {
    async fn init(&mut self, _config: &Config) -> Result<(), MixerError> {
        Ok(())
    }

    async fn activate(&mut self) -> Result<(), MixerError> {
        Ok(())
    }

    async fn play(&mut self, samples: &[i16]) -> Result<usize, MixerError> {
        Ok(samples.len())
    }

    async fn deactivate(&mut self) -> Result<(), MixerError> {
        Ok(())
    }

    async fn pace(&mut self) {
        // Without this the null sink would drain decoders instantly.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn ready(&self) -> bool {
        true
    }
}

/// Scale interleaved samples by per-channel volume (0-100).
pub fn apply_volume(samples: &mut [i16], left: u8, right: u8, channels: u8) {
    if left >= 100 && right >= 100 {
        return;
    }
    let left = left.min(100) as i32;
    let right = right.min(100) as i32;
    if channels == 2 {
        for pair in samples.chunks_exact_mut(2) {
            pair[0] = (pair[0] as i32 * left / 100) as i16;
            pair[1] = (pair[1] as i32 * right / 100) as i16;
        }
    } else {
        // Mono (or anything exotic): use the louder channel.
        let gain = left.max(right);
        for sample in samples {
            *sample = (*sample as i32 * gain / 100) as i16;
        }
    }
}

/// Owns the backend and its device state, imposing the retry backoff.
pub struct MixerDriver {
    backend: Box<dyn Backend>,
    state: DeviceState,
}

impl MixerDriver {
    pub async fn new(mut backend: Box<dyn Backend>, config: &Config) -> Result<Self, MixerError> {
        backend.init(config).await?;
        Ok(MixerDriver {
            backend,
            state: DeviceState::Closed,
        })
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Open the device if necessary. After an error a short delay is
    /// imposed before the retry.
    pub async fn ensure_open(&mut self) -> Result<(), MixerError> {
        if self.state == DeviceState::Error {
            tokio::time::sleep(DEVICE_RETRY).await;
        }
        if self.state != DeviceState::Open {
            match self.backend.activate().await {
                Ok(()) => self.state = DeviceState::Open,
                Err(e) => {
                    self.state = DeviceState::Error;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub async fn play(&mut self, samples: &[i16]) -> Result<usize, MixerError> {
        match self.backend.play(samples).await {
            Ok(n) => Ok(n),
            Err(e) => {
                self.state = DeviceState::Error;
                Err(e)
            }
        }
    }

    pub async fn pace(&mut self) {
        self.backend.pace().await;
    }

    pub async fn close(&mut self) {
        if self.state == DeviceState::Open {
            if let Err(e) = self.backend.deactivate().await {
                debug!(error = %e, "backend deactivate failed");
            }
            self.state = DeviceState::Closed;
        }
    }
}
