//! Per-SSRC stream state: health scoring, counters, the inbound reorder
//! window and the outbound retransmission ring.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub mod counter;
pub mod recv;
pub mod send;

pub(crate) mod receive_window;
pub(crate) mod send_buffer;

pub use counter::RtpDataCounter;
pub use recv::{NackConfig, RtpStreamRecv};
pub use send::RtpStreamSend;

/// Maximum interval between RTCP reports for audio streams.
pub(crate) const RTCP_MAX_AUDIO_INTERVAL: Duration = Duration::from_millis(5000);
/// Maximum interval between RTCP reports for video streams.
pub(crate) const RTCP_MAX_VIDEO_INTERVAL: Duration = Duration::from_millis(1000);

/// Number of loss samples kept for the stream score.
const SCORE_SAMPLES: usize = 8;
/// Average score at or above which a stream counts as healthy.
const HEALTHY_SCORE: u8 = 5;

/// Static parameters of one RTP stream.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpStreamParams {
    pub ssrc: u32,
    pub payload_type: u8,
    pub mime_type: String,
    pub clock_rate: u32,
    pub use_nack: bool,
    pub use_pli: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtx_payload_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtx_ssrc: Option<u32>,
}

/// State shared by both stream directions: parameters, activity tracking and
/// the loss-based health score.
#[derive(Debug)]
pub(crate) struct RtpStream {
    pub(crate) params: RtpStreamParams,
    /// Last time a packet moved through the stream.
    pub(crate) last_activity: Option<Instant>,
    scores: VecDeque<u8>,
    healthy: bool,
}

impl RtpStream {
    pub(crate) fn new(params: RtpStreamParams) -> Self {
        Self {
            params,
            last_activity: None,
            scores: VecDeque::with_capacity(SCORE_SAMPLES),
            healthy: true,
        }
    }

    /// Records a loss sample (RTCP `fraction lost`, 0..=255). Returns the new
    /// health state when the sample flips it.
    pub(crate) fn push_loss_sample(&mut self, fraction_lost: u8) -> Option<bool> {
        // Map fraction lost onto a 0..=10 score.
        let score = 10u8.saturating_sub((u16::from(fraction_lost) * 10 / 256) as u8);

        if self.scores.len() == SCORE_SAMPLES {
            self.scores.pop_front();
        }
        self.scores.push_back(score);

        let sum: u32 = self.scores.iter().map(|&s| u32::from(s)).sum();
        let average = (sum / self.scores.len() as u32) as u8;
        let healthy = average >= HEALTHY_SCORE;

        if healthy != self.healthy {
            self.healthy = healthy;
            return Some(healthy);
        }
        None
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub(crate) fn score(&self) -> u8 {
        if self.scores.is_empty() {
            return 10;
        }
        let sum: u32 = self.scores.iter().map(|&s| u32::from(s)).sum();
        (sum / self.scores.len() as u32) as u8
    }
}
