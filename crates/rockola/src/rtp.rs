//! The RTP transmitter.
//!
//! Packetizes decoded PCM into RTP (RFC 3550/3551, payload types 10/11,
//! L16 network byte order) and keeps the wire timestamp synchronized with
//! wall-clock time so receivers can reconstruct silence across idle gaps.
//!
//! The internal sample counter `rtp_time` is 64-bit; the wire timestamp is
//! its low 32 bits plus a random per-session offset. `rtp_time` never moves
//! backwards: packets must not overlap, so when we find ourselves ahead of
//! real time we wait instead.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use rockoconf::Config;

/// How far ahead of wall clock the transmitter runs.
pub const RTP_AHEAD_MS: u64 = 1000;

/// Consecutive send failures tolerated before giving up.
const MAX_ERRORS: u32 = 10;

const RTP_HEADER_BYTES: usize = 12;
const SEND_BUFFER_BYTES: usize = 128 * 1024;

/// Unicast listeners registered with `rtp-request`, keyed by connection
/// tag so a closing connection can take its recipient away.
pub type RecipientSet = Rc<RefCell<HashMap<u64, SocketAddr>>>;

#[derive(Debug, Error)]
pub enum RtpError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot resolve RTP destination {0:?}")]
    BadDestination(String),
    #[error("{MAX_ERRORS} consecutive transmission failures")]
    TooManyFailures,
}

pub struct RtpSender {
    socket: UdpSocket,
    dest: Option<SocketAddr>,
    recipients: RecipientSet,

    rate: u32,
    channels: u8,
    max_payload: usize,

    ssrc: u32,
    seq: u16,
    ts_offset: u32,
    /// Samples sent (not frames), 64-bit to survive long sessions.
    rtp_time: u64,
    epoch: Instant,
    marker: bool,
    errors: u32,
    last_ahead_warning: Option<Instant>,
}

impl RtpSender {
    /// Bind and configure the socket per the addressing mode the
    /// destination implies: multicast (TTL + loopback), broadcast, or
    /// plain unicast. With no configured destination the transmitter
    /// serves `rtp-request` listeners only.
    pub async fn new(config: &Config, recipients: RecipientSet) -> Result<RtpSender, RtpError> {
        let dest = match &config.broadcast {
            Some((host, port)) => Some(resolve(host, *port).await?),
            None => None,
        };

        let local: SocketAddr = match &config.broadcast_from {
            Some((host, port)) => resolve(host, *port).await?,
            None => match dest {
                Some(SocketAddr::V6(_)) => "[::]:0".parse().expect("literal"),
                _ => "0.0.0.0:0".parse().expect("literal"),
            },
        };
        let socket = UdpSocket::bind(local).await?;

        if let Some(dest) = dest {
            match dest {
                SocketAddr::V4(v4) if v4.ip().is_multicast() => {
                    socket.set_multicast_ttl_v4(config.multicast_ttl)?;
                    socket.set_multicast_loop_v4(config.multicast_loop)?;
                    info!(%dest, ttl = config.multicast_ttl, "RTP multicast");
                }
                SocketAddr::V6(v6) if v6.ip().is_multicast() => {
                    socket.set_multicast_loop_v6(config.multicast_loop)?;
                    info!(%dest, "RTP multicast");
                }
                SocketAddr::V4(v4) if v4.ip().octets()[3] == 0xff => {
                    socket.set_broadcast(true)?;
                    info!(%dest, "RTP broadcast");
                }
                _ => info!(%dest, "RTP unicast"),
            }
            socket.connect(dest).await?;
        } else {
            debug!("no RTP destination configured, request mode only");
        }

        enlarge_send_buffer(&socket);

        let mut rng = rand::thread_rng();
        Ok(RtpSender {
            socket,
            dest,
            recipients,
            rate: config.sample_rate,
            channels: config.channels.max(1),
            max_payload: config.rtp_max_payload.max(RTP_HEADER_BYTES + 4),
            ssrc: rng.gen(),
            seq: rng.gen(),
            ts_offset: rng.gen(),
            rtp_time: 0,
            epoch: Instant::now(),
            marker: true,
            errors: 0,
            last_ahead_warning: None,
        })
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.dest
    }

    fn payload_type(&self) -> u8 {
        // RFC 3551: 10 = L16 stereo, 11 = L16 mono.
        if self.channels == 1 {
            11
        } else {
            10
        }
    }

    fn samples_per_second(&self) -> u64 {
        self.rate as u64 * self.channels as u64
    }

    fn ahead_samples(&self) -> u64 {
        self.samples_per_second() * RTP_AHEAD_MS / 1000
    }

    /// Wall-clock position in samples, rounded down to a frame boundary.
    fn target_samples(&self) -> u64 {
        let micros = self.epoch.elapsed().as_micros() as u64;
        let samples = micros * self.samples_per_second() / 1_000_000;
        samples - samples % self.channels as u64
    }

    /// Re-anchor `rtp_time` to real time. Idle gaps advance it (receivers
    /// infer silence); it is never pulled backwards.
    fn sync_clock(&mut self) {
        let target = self.target_samples();
        if target > self.rtp_time {
            if self.rtp_time != 0 {
                debug!(
                    gap_samples = target - self.rtp_time,
                    "advancing RTP clock over idle gap"
                );
            }
            self.rtp_time = target;
            self.marker = true;
        } else if self.rtp_time > target + self.ahead_samples() {
            let now = Instant::now();
            let stale = self
                .last_ahead_warning
                .map_or(true, |t| now.duration_since(t) > Duration::from_secs(5));
            if stale {
                warn!(
                    ahead_samples = self.rtp_time - target,
                    "RTP clock is ahead of wall clock; not rewinding"
                );
                self.last_ahead_warning = Some(now);
            }
        }
    }

    /// The next packet opens a new talkspurt (start or resume).
    pub fn mark_discontinuity(&mut self) {
        self.marker = true;
    }

    /// Sleep until we are no longer a full look-ahead window in front of
    /// real time. This is what interleaves transmission with everything
    /// else on the loop.
    pub async fn pace(&mut self) {
        let target = self.target_samples();
        let ahead = self.ahead_samples();
        if self.rtp_time > target + ahead {
            let surplus = self.rtp_time - target - ahead;
            let micros = surplus * 1_000_000 / self.samples_per_second();
            tokio::time::sleep(Duration::from_micros(micros)).await;
        }
    }

    /// Packetize and transmit; consumes all of `samples` (whole frames per
    /// packet, each within the payload bound).
    pub async fn transmit(&mut self, samples: &[i16]) -> Result<(), RtpError> {
        let frame = self.channels as usize;
        let samples_per_packet = {
            let max_samples = self.max_payload / 2;
            max_samples - max_samples % frame
        };
        for chunk in samples.chunks(samples_per_packet) {
            self.sync_clock();
            self.send_packet(chunk).await?;
        }
        Ok(())
    }

    async fn send_packet(&mut self, payload: &[i16]) -> Result<(), RtpError> {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_BYTES + payload.len() * 2);
        buf.put_u8(0x80); // V=2, P=0, X=0, CC=0
        buf.put_u8(self.payload_type() | if self.marker { 0x80 } else { 0 });
        buf.put_u16(self.seq);
        buf.put_u32((self.rtp_time as u32).wrapping_add(self.ts_offset));
        buf.put_u32(self.ssrc);
        for &sample in payload {
            buf.put_i16(sample);
        }

        let mut sent_any = false;
        let mut failed = false;
        if self.dest.is_some() {
            sent_any = true;
            failed |= self.socket.send(&buf).await.is_err();
        }
        let recipients: Vec<SocketAddr> = self.recipients.borrow().values().copied().collect();
        for addr in recipients {
            sent_any = true;
            failed |= self.socket.send_to(&buf, addr).await.is_err();
        }

        // Sequencing and the sample clock advance whether or not anyone is
        // listening right now.
        self.seq = self.seq.wrapping_add(1);
        self.rtp_time += payload.len() as u64;
        self.marker = false;

        if sent_any {
            self.note_send_result(!failed)?;
        }
        Ok(())
    }

    fn note_send_result(&mut self, ok: bool) -> Result<(), RtpError> {
        if ok {
            self.errors /= 2;
            Ok(())
        } else {
            self.errors += 1;
            if self.errors >= MAX_ERRORS {
                Err(RtpError::TooManyFailures)
            } else {
                Ok(())
            }
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, RtpError> {
    tokio::net::lookup_host((host, port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| RtpError::BadDestination(format!("{}:{}", host, port)))
}

/// Best effort: a bigger kernel buffer smooths bursts, but the default
/// works too.
fn enlarge_send_buffer(socket: &UdpSocket) {
    use nix::sys::socket::{setsockopt, sockopt};
    if let Err(e) = setsockopt(socket, sockopt::SndBuf, &SEND_BUFFER_BYTES) {
        debug!(error = %e, "could not enlarge RTP send buffer");
    }
}
