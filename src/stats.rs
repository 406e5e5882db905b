//! Send-side statistics
//!
//! Turns the engine's cumulative counters into per-interval metrics. Each
//! sample is computed against the previous snapshot of the same stream:
//! bitrate from the byte delta, loss rate over a window of at least
//! [`AUDIO_LOSS_WINDOW_PACKETS`] / [`VIDEO_LOSS_WINDOW_PACKETS`] packets.
//! Any rate whose denominator is zero or negative is reported as 0.

use crate::engine::RawCounters;
use serde::Serialize;
use std::fmt;

/// Minimum sent-packet advance before the audio loss rate is recomputed
pub const AUDIO_LOSS_WINDOW_PACKETS: u64 = 100;
/// Minimum sent-packet advance before the video loss rate is recomputed
pub const VIDEO_LOSS_WINDOW_PACKETS: u64 = 200;

const AUDIO_LEVEL_FULL_SCALE: f64 = 32768.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioStats {
    pub timestamp_ms: f64,
    /// Bytes per second
    pub bitrate: f64,
    pub bytes_sent: u64,
    /// Loss baseline: lost count at the last loss-rate computation
    pub packets_lost: u64,
    /// Loss baseline: sent count at the last loss-rate computation
    pub packets_sent: u64,
    /// Percent, two decimals
    pub recent_loss_rate: f64,
    pub rtt_ms: u32,
    /// 0..=1, five decimals
    pub audio_level: f64,
    pub total_energy: f64,
    pub total_duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VideoStats {
    pub timestamp_ms: f64,
    pub input_width: u32,
    pub input_height: u32,
    pub input_frame_rate: u32,
    pub sent_width: u32,
    pub sent_height: u32,
    pub sent_frame_rate: u32,
    pub rtt_ms: u32,
    pub avg_encode_ms: u32,
    pub packets_lost: u64,
    pub packets_sent: u64,
    pub recent_loss_rate: f64,
    pub bytes_sent: u64,
    /// Bytes per second
    pub bitrate: f64,
}

fn kbps(bytes_per_second: f64) -> f64 {
    bytes_per_second * 8.0 / 1024.0
}

impl fmt::Display for AudioStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------ audio ------")?;
        writeln!(f, "input level: {}", self.audio_level)?;
        writeln!(f, "bitrate: {:.2}Kbps", kbps(self.bitrate))?;
        writeln!(f, "rtt: {}", self.rtt_ms)?;
        writeln!(f, "loss: {}%", self.recent_loss_rate)
    }
}

impl fmt::Display for VideoStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------ video ------")?;
        writeln!(f, "input resolution: {}*{}", self.input_width, self.input_height)?;
        writeln!(f, "sent resolution: {}*{}", self.sent_width, self.sent_height)?;
        writeln!(f, "input frame rate: {}", self.input_frame_rate)?;
        writeln!(f, "sent frame rate: {}", self.sent_frame_rate)?;
        writeln!(f, "avg encode: {}ms", self.avg_encode_ms)?;
        writeln!(f, "bitrate: {:.2}Kbps", kbps(self.bitrate))?;
        writeln!(f, "rtt: {}", self.rtt_ms)?;
        writeln!(f, "loss: {}%", self.recent_loss_rate)
    }
}

/// Round to `digits` decimal places
fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

/// Normalize a raw linear sample magnitude to 0..=1 (five decimals)
pub fn normalize_audio_level(raw: i32) -> f64 {
    round_to(raw.max(0) as f64 / AUDIO_LEVEL_FULL_SCALE, 5)
}

/// Bytes per second between two cumulative byte counts.
///
/// Zero without a previous non-zero baseline, on a non-positive time delta,
/// or when the counter went backwards.
pub fn bitrate(previous_bytes: u64, previous_ms: f64, current_bytes: u64, current_ms: f64) -> f64 {
    if previous_bytes == 0 || current_bytes < previous_bytes {
        return 0.0;
    }
    let elapsed = current_ms - previous_ms;
    if !(elapsed > 0.0) {
        return 0.0;
    }
    (current_bytes - previous_bytes) as f64 * 1000.0 / elapsed
}

/// Loss window state carried between samples
#[derive(Debug, Clone, Copy, PartialEq)]
struct LossWindow {
    sent: u64,
    lost: u64,
    rate: f64,
}

impl LossWindow {
    /// Recompute only once more than `threshold` packets were sent since the
    /// baseline; a shrinking sent counter means the engine reset it.
    fn advance(self, sent: u64, lost: u64, threshold: u64) -> LossWindow {
        if sent < self.sent {
            return LossWindow { sent, lost, rate: 0.0 };
        }
        let sent_delta = sent - self.sent;
        if sent_delta <= threshold {
            return self;
        }
        let lost_delta = lost.saturating_sub(self.lost);
        // Integer percent with two decimals, as the engine's own reporting does
        let rate = (lost_delta * 10_000 / sent_delta) as f64 / 100.0;
        LossWindow { sent, lost, rate }
    }
}

fn lost_count(raw: &RawCounters, fallback: u64) -> u64 {
    raw.packets_lost.map(|lost| lost.max(0) as u64).unwrap_or(fallback)
}

/// Produce the next audio snapshot from the previous one and a fresh report
pub fn sample_audio(previous: &AudioStats, raw: &RawCounters) -> AudioStats {
    let bytes_sent = raw.bytes_sent.unwrap_or(0);
    let window = LossWindow {
        sent: previous.packets_sent,
        lost: previous.packets_lost,
        rate: previous.recent_loss_rate,
    }
    .advance(
        raw.packets_sent.unwrap_or(previous.packets_sent),
        lost_count(raw, previous.packets_lost),
        AUDIO_LOSS_WINDOW_PACKETS,
    );

    AudioStats {
        timestamp_ms: raw.timestamp_ms,
        bitrate: bitrate(previous.bytes_sent, previous.timestamp_ms, bytes_sent, raw.timestamp_ms),
        bytes_sent,
        packets_lost: window.lost,
        packets_sent: window.sent,
        recent_loss_rate: window.rate,
        rtt_ms: raw.rtt_ms.unwrap_or(0),
        audio_level: raw.audio_input_level.map(normalize_audio_level).unwrap_or(0.0),
        total_energy: raw.total_audio_energy.unwrap_or(0.0),
        total_duration: raw.total_samples_duration.unwrap_or(0.0),
    }
}

/// Produce the next video snapshot from the previous one and a fresh report
pub fn sample_video(previous: &VideoStats, raw: &RawCounters) -> VideoStats {
    let bytes_sent = raw.bytes_sent.unwrap_or(0);
    let window = LossWindow {
        sent: previous.packets_sent,
        lost: previous.packets_lost,
        rate: previous.recent_loss_rate,
    }
    .advance(
        raw.packets_sent.unwrap_or(previous.packets_sent),
        lost_count(raw, previous.packets_lost),
        VIDEO_LOSS_WINDOW_PACKETS,
    );

    VideoStats {
        timestamp_ms: raw.timestamp_ms,
        input_width: raw.frame_width_input.unwrap_or(0),
        input_height: raw.frame_height_input.unwrap_or(0),
        input_frame_rate: raw.frame_rate_input.unwrap_or(0),
        sent_width: raw.frame_width_sent.unwrap_or(0),
        sent_height: raw.frame_height_sent.unwrap_or(0),
        sent_frame_rate: raw.frame_rate_sent.unwrap_or(0),
        rtt_ms: raw.rtt_ms.unwrap_or(0),
        avg_encode_ms: raw.avg_encode_ms.unwrap_or(0),
        packets_lost: window.lost,
        packets_sent: window.sent,
        recent_loss_rate: window.rate,
        bytes_sent,
        bitrate: bitrate(previous.bytes_sent, previous.timestamp_ms, bytes_sent, raw.timestamp_ms),
    }
}

/// Average audio level over a caller-controlled window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AudioLevelMeter {
    baseline_energy: f64,
    baseline_duration: f64,
}

impl AudioLevelMeter {
    /// Start a new window at `stats`
    pub fn reset(&mut self, stats: &AudioStats) {
        self.baseline_energy = stats.total_energy;
        self.baseline_duration = stats.total_duration;
    }

    /// RMS level since the baseline, five decimals; always rebaselines.
    ///
    /// Without a baseline, or with no (or negative) sample duration since it,
    /// the instantaneous level is returned.
    pub fn average(&mut self, stats: &AudioStats) -> f64 {
        let duration = stats.total_duration - self.baseline_duration;
        let energy = stats.total_energy - self.baseline_energy;
        let unset = self.baseline_duration == 0.0;
        self.reset(stats);
        if unset || !(duration > 0.0) {
            return stats.audio_level;
        }
        if energy <= 0.0 {
            return 0.0;
        }
        round_to((energy / duration).sqrt(), 5)
    }
}
