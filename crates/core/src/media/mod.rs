//! RTP packetization of encoded camera frames.
//!
//! Every delivered frame is one H.264 access unit in Annex B format. The
//! packetizer splits it into RTP packets no larger than the configured
//! maximum packet size and keeps the per-stream RTP state (SSRC, sequence
//! number, 90 kHz timestamp) that all viewers of a camera share.
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |

pub mod h264;
pub mod rtp;

/// Codec-specific RTP packetizer.
///
/// Owned by a [`StreamFanout`](crate::fanout::StreamFanout); it is only
/// touched from the event-loop thread.
pub trait Packetizer {
    /// Packetize one access unit into complete RTP packets (header included).
    ///
    /// `timestamp_increment` advances the RTP clock after this frame.
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>>;

    /// Codec name for `a=rtpmap` (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    fn clock_rate(&self) -> u32;

    fn payload_type(&self) -> u8;

    /// Media-level SDP attribute lines, `a=` prefix included.
    fn sdp_attributes(&self) -> Vec<String>;

    /// Sequence number of the next packet (for `RTP-Info`).
    fn next_sequence(&self) -> u16;

    /// RTP timestamp of the next frame (for `RTP-Info`).
    fn next_rtp_timestamp(&self) -> u32;
}
