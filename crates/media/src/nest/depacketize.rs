//! H.264 RTP depacketization (RFC 6184): single NAL units, FU-A fragments
//! and STAP-A aggregates, reassembled into Annex-B access units on the RTP
//! marker bit.

use bytes::Bytes;

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;
const FU_START_BIT: u8 = 0x80;
/// Duration assigned to the first frame, before a timestamp delta exists
/// (90 kHz units, one frame at ~30 fps).
const FIRST_FRAME_DURATION: u32 = 3000;
const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

/// One reassembled access unit.
#[derive(Debug, Clone)]
pub struct H264AccessUnit {
    pub annex_b: Bytes,
    pub duration_rtp_units: u32,
}

#[derive(Default)]
pub struct H264Depacketizer {
    nals: Vec<Vec<u8>>,
    last_rtp_ts: Option<u32>,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one RTP payload. Returns a complete access unit when the packet
    /// carries the marker bit and the buffer holds at least one NAL.
    pub fn push(&mut self, payload: &[u8], marker: bool, rtp_ts: u32) -> Option<H264AccessUnit> {
        if !payload.is_empty() {
            let nal_type = payload[0] & 0x1F;
            match nal_type {
                1..=23 => self.nals.push(payload.to_vec()),
                NAL_TYPE_FU_A => self.push_fu_a(payload),
                NAL_TYPE_STAP_A => self.push_stap_a(payload),
                _ => {
                    tracing::debug!(nal_type, "Ignoring unsupported NAL packetization type");
                }
            }
        }

        if !marker || self.nals.is_empty() {
            return None;
        }

        let mut annex_b =
            Vec::with_capacity(self.nals.iter().map(|n| n.len() + 4).sum::<usize>());
        for nal in self.nals.drain(..) {
            annex_b.extend_from_slice(&ANNEX_B_START_CODE);
            annex_b.extend_from_slice(&nal);
        }

        let duration = match self.last_rtp_ts {
            Some(last) => rtp_ts.wrapping_sub(last),
            None => FIRST_FRAME_DURATION,
        };
        self.last_rtp_ts = Some(rtp_ts);

        Some(H264AccessUnit {
            annex_b: Bytes::from(annex_b),
            duration_rtp_units: duration,
        })
    }

    fn push_fu_a(&mut self, payload: &[u8]) {
        if payload.len() < 3 {
            return;
        }
        let fu_indicator = payload[0];
        let fu_header = payload[1];
        if fu_header & FU_START_BIT != 0 {
            // Reconstruct the NAL header from the indicator's NRI bits and
            // the fragmented unit's type.
            let nal_header = (fu_indicator & 0xE0) | (fu_header & 0x1F);
            let mut nal = Vec::with_capacity(1 + payload.len() - 2);
            nal.push(nal_header);
            nal.extend_from_slice(&payload[2..]);
            self.nals.push(nal);
        } else if let Some(last) = self.nals.last_mut() {
            last.extend_from_slice(&payload[2..]);
        } else {
            // Middle/end fragment without its start: nothing to append to.
            tracing::debug!("Dropping FU-A continuation without a start fragment");
        }
    }

    fn push_stap_a(&mut self, payload: &[u8]) {
        let mut offset = 1;
        while offset + 2 <= payload.len() {
            let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if size == 0 || offset + size > payload.len() {
                break;
            }
            self.nals.push(payload[offset..offset + size].to_vec());
            offset += size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_nal_with_marker_emits_annex_b() {
        let mut depack = H264Depacketizer::new();
        // NAL type 5 (IDR), NRI 3
        let payload = [0x65, 0xAA, 0xBB];
        let unit = depack.push(&payload, true, 90_000).expect("marker emits");
        assert_eq!(&unit.annex_b[..4], &[0, 0, 0, 1]);
        assert_eq!(&unit.annex_b[4..], &payload);
        assert_eq!(unit.duration_rtp_units, 3000);
    }

    #[test]
    fn duration_is_timestamp_delta_after_first_frame() {
        let mut depack = H264Depacketizer::new();
        assert!(depack.push(&[0x65, 0x01], true, 1000).is_some());
        let second = depack.push(&[0x41, 0x02], true, 10_000).unwrap();
        assert_eq!(second.duration_rtp_units, 9000);
    }

    #[test]
    fn no_marker_accumulates() {
        let mut depack = H264Depacketizer::new();
        assert!(depack.push(&[0x67, 0x01], false, 0).is_none());
        assert!(depack.push(&[0x68, 0x02], false, 0).is_none());
        let unit = depack.push(&[0x65, 0x03], true, 0).unwrap();
        // Three NALs, three start codes.
        let starts = unit
            .annex_b
            .windows(4)
            .filter(|w| *w == [0, 0, 0, 1])
            .count();
        assert_eq!(starts, 3);
    }

    #[test]
    fn fu_a_reassembles_fragmented_nal() {
        let mut depack = H264Depacketizer::new();
        // FU indicator: NRI=3, type=28 → 0x7C. FU header start + type 5 → 0x85.
        assert!(depack.push(&[0x7C, 0x85, 0x10, 0x11], false, 0).is_none());
        // Middle fragment
        assert!(depack.push(&[0x7C, 0x05, 0x12], false, 0).is_none());
        // End fragment (end bit 0x40) with marker
        let unit = depack.push(&[0x7C, 0x45, 0x13], true, 0).unwrap();
        // Reconstructed header: (0x7C & 0xE0) | (0x85 & 0x1F) = 0x60 | 0x05
        assert_eq!(&unit.annex_b[..], &[0, 0, 0, 1, 0x65, 0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn fu_a_continuation_without_start_is_dropped() {
        let mut depack = H264Depacketizer::new();
        assert!(depack.push(&[0x7C, 0x05, 0x12], false, 0).is_none());
        // Nothing buffered, marker emits nothing.
        assert!(depack.push(&[0x7C, 0x45, 0x13], true, 0).is_none());
    }

    #[test]
    fn stap_a_unpacks_length_prefixed_nals() {
        let mut depack = H264Depacketizer::new();
        // STAP-A header (type 24), then [len=2][0x67 0x01], [len=3][0x68 0x02 0x03]
        let payload = [0x78, 0x00, 0x02, 0x67, 0x01, 0x00, 0x03, 0x68, 0x02, 0x03];
        let unit = depack.push(&payload, true, 0).unwrap();
        assert_eq!(
            &unit.annex_b[..],
            &[0, 0, 0, 1, 0x67, 0x01, 0, 0, 0, 1, 0x68, 0x02, 0x03]
        );
    }

    #[test]
    fn stap_a_truncated_length_is_tolerated() {
        let mut depack = H264Depacketizer::new();
        // Claims 9 bytes but only 2 remain.
        let payload = [0x78, 0x00, 0x09, 0x67, 0x01];
        assert!(depack.push(&payload, true, 0).is_none());
    }

    #[test]
    fn marker_with_empty_buffer_emits_nothing() {
        let mut depack = H264Depacketizer::new();
        assert!(depack.push(&[], true, 0).is_none());
    }

    #[test]
    fn rtp_timestamp_wraparound_duration() {
        let mut depack = H264Depacketizer::new();
        assert!(depack.push(&[0x65, 0x01], true, u32::MAX - 999).is_some());
        let unit = depack.push(&[0x41, 0x02], true, 2000).unwrap();
        assert_eq!(unit.duration_rtp_units, 3000);
    }
}
