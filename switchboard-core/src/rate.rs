//! Per-sink transmit rate control

use crate::format::{options, MediaFormat};
use crate::frame::MediaFrame;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of a rate check for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// Write the frame
    Send,
    /// Do not write the frame
    Skip {
        /// Ask the sink's peer for a key frame
        request_key_frame: bool,
        /// Frames to write in its place
        substitutes: Vec<MediaFrame>,
    },
}

/// Decides, frame by frame, whether a sink may transmit
pub trait RateController: Send {
    /// Check `frame`, about to be written at `now`
    fn decide(&mut self, frame: &MediaFrame, now: Instant) -> RateDecision;
}

const WINDOW: Duration = Duration::from_secs(1);
const KEY_FRAME_AFTER_SKIPPED_FRAMES: u32 = 3;

/// Sliding-window bit rate limiter for video sinks
///
/// Decisions are made at video frame boundaries: once the first packet of a
/// frame is skipped, every packet up to and including the marker packet is
/// skipped too. After a run of skipped frames the controller asks once for a
/// key frame so the receiver can resynchronise.
#[derive(Debug)]
pub struct BitRateController {
    bytes_per_window: u64,
    sent: VecDeque<(Instant, usize)>,
    sent_bytes: u64,
    at_frame_start: bool,
    skipping_frame: bool,
    skipped_frames: u32,
    key_frame_requested: bool,
}

impl BitRateController {
    /// Limit to `bit_rate` bits per second
    pub fn new(bit_rate: u32) -> Self {
        Self {
            bytes_per_window: u64::from(bit_rate / 8),
            sent: VecDeque::new(),
            sent_bytes: 0,
            at_frame_start: true,
            skipping_frame: false,
            skipped_frames: 0,
            key_frame_requested: false,
        }
    }

    /// Controller for a format carrying a target bit rate
    pub fn for_format(format: &MediaFormat) -> Option<Self> {
        format
            .option_u32(options::TARGET_BIT_RATE)
            .filter(|rate| *rate > 0)
            .map(Self::new)
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, bytes)) = self.sent.front().copied() {
            if now.duration_since(at) < WINDOW {
                break;
            }
            self.sent.pop_front();
            self.sent_bytes -= bytes as u64;
        }
    }
}

impl RateController for BitRateController {
    fn decide(&mut self, frame: &MediaFrame, now: Instant) -> RateDecision {
        self.expire(now);

        if self.at_frame_start {
            let size = frame.payload_len() as u64;
            self.skipping_frame = self.sent_bytes + size > self.bytes_per_window;
        }
        self.at_frame_start = frame.marker;

        if !self.skipping_frame {
            self.sent.push_back((now, frame.payload_len()));
            self.sent_bytes += frame.payload_len() as u64;
            if frame.marker {
                self.skipped_frames = 0;
                self.key_frame_requested = false;
            }
            return RateDecision::Send;
        }

        let mut request_key_frame = false;
        if frame.marker {
            self.skipped_frames += 1;
            if self.skipped_frames >= KEY_FRAME_AFTER_SKIPPED_FRAMES && !self.key_frame_requested {
                self.key_frame_requested = true;
                request_key_frame = true;
            }
        }
        RateDecision::Skip {
            request_key_frame,
            substitutes: Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::format::well_known;

    fn packet(size: usize, marker: bool) -> MediaFrame {
        MediaFrame::new(96, 0, vec![0u8; size]).with_marker(marker)
    }

    #[test]
    fn test_sends_under_budget() {
        let mut rc = BitRateController::new(8 * 1000);
        let now = Instant::now();
        assert_eq!(rc.decide(&packet(400, true), now), RateDecision::Send);
        assert_eq!(rc.decide(&packet(400, true), now), RateDecision::Send);
    }

    #[test]
    fn test_skips_whole_frame_over_budget() {
        let mut rc = BitRateController::new(8 * 1000);
        let now = Instant::now();
        assert_eq!(rc.decide(&packet(900, true), now), RateDecision::Send);
        assert!(matches!(
            rc.decide(&packet(200, false), now),
            RateDecision::Skip { .. }
        ));
        // Rest of the frame is skipped even though it would fit.
        assert!(matches!(
            rc.decide(&packet(10, true), now),
            RateDecision::Skip { .. }
        ));
    }

    #[test]
    fn test_window_slides() {
        let mut rc = BitRateController::new(8 * 1000);
        let start = Instant::now();
        assert_eq!(rc.decide(&packet(1000, true), start), RateDecision::Send);
        assert!(matches!(
            rc.decide(&packet(1000, true), start + Duration::from_millis(500)),
            RateDecision::Skip { .. }
        ));
        assert_eq!(
            rc.decide(&packet(1000, true), start + Duration::from_millis(1001)),
            RateDecision::Send
        );
    }

    #[test]
    fn test_key_frame_requested_once_per_run() {
        let mut rc = BitRateController::new(8 * 100);
        let now = Instant::now();
        assert_eq!(rc.decide(&packet(100, true), now), RateDecision::Send);
        let requests: Vec<Option<bool>> = (0..5)
            .map(|_| match rc.decide(&packet(100, true), now) {
                RateDecision::Skip {
                    request_key_frame, ..
                } => Some(request_key_frame),
                RateDecision::Send => None,
            })
            .collect();
        assert_eq!(
            requests,
            vec![Some(false), Some(false), Some(true), Some(false), Some(false)]
        );
    }

    #[test]
    fn test_for_format_requires_target() {
        let h264 = well_known::get(well_known::H264).unwrap();
        assert!(BitRateController::for_format(&h264).is_none());
        let limited = h264.with_option(options::TARGET_BIT_RATE, 64_000);
        assert!(BitRateController::for_format(&limited).is_some());
    }
}
