//! Frame parsing and emission for the four wire families.
//!
//! The first 16-bit word disambiguates: bit 15 set means a full frame, a
//! zero word introduces either a video mini frame (next word has bit 15 set)
//! or a meta frame, and anything else is an audio mini frame.

use crate::constants::{
    FLAG_FULL, FLAG_RETRANS, FULL_HDR_LEN, META_HDR_LEN, META_TRUNK, META_TRUNK_MINI,
    MINI_HDR_LEN, VIDEO_HDR_LEN,
};
use crate::error::{WireError, WireResult};

/// A reliable frame carrying sequence numbers and a typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullFrame {
    pub scallno: u16,
    pub dcallno: u16,
    pub retrans: bool,
    pub ts: u32,
    pub oseqno: u8,
    pub iseqno: u8,
    pub frametype: u8,
    pub csub: u8,
    pub payload: Vec<u8>,
}

impl FullFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FULL_HDR_LEN + self.payload.len());
        out.extend_from_slice(&(self.scallno | FLAG_FULL).to_be_bytes());
        let dword = if self.retrans {
            self.dcallno | FLAG_RETRANS
        } else {
            self.dcallno
        };
        out.extend_from_slice(&dword.to_be_bytes());
        out.extend_from_slice(&self.ts.to_be_bytes());
        out.push(self.oseqno);
        out.push(self.iseqno);
        out.push(self.frametype);
        out.push(self.csub);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        if data.len() < FULL_HDR_LEN {
            return Err(WireError::TooShort {
                need: FULL_HDR_LEN,
                have: data.len(),
            });
        }
        let scallno = u16::from_be_bytes([data[0], data[1]]) & !FLAG_FULL;
        let dword = u16::from_be_bytes([data[2], data[3]]);
        Ok(FullFrame {
            scallno,
            dcallno: dword & !FLAG_RETRANS,
            retrans: dword & FLAG_RETRANS != 0,
            ts: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            oseqno: data[8],
            iseqno: data[9],
            frametype: data[10],
            csub: data[11],
            payload: data[FULL_HDR_LEN..].to_vec(),
        })
    }
}

/// Unreliable audio frame. Codec and high timestamp bits are implied by the
/// last full frame of the same call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiniFrame {
    pub scallno: u16,
    pub ts: u16,
    pub payload: Vec<u8>,
}

impl MiniFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MINI_HDR_LEN + self.payload.len());
        out.extend_from_slice(&self.scallno.to_be_bytes());
        out.extend_from_slice(&self.ts.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Unreliable video frame: 15-bit timestamp plus a mark bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub scallno: u16,
    pub ts: u16,
    pub mark: bool,
    pub payload: Vec<u8>,
}

impl VideoFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VIDEO_HDR_LEN + self.payload.len());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(self.scallno | FLAG_FULL).to_be_bytes());
        let ts = if self.mark {
            self.ts | 0x8000
        } else {
            self.ts & 0x7FFF
        };
        out.extend_from_slice(&ts.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// One call's contribution to a trunk meta frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrunkEntry {
    pub callno: u16,
    /// Present only in the timestamped entry format.
    pub ts: Option<u16>,
    pub payload: Vec<u8>,
}

/// A meta frame aggregating mini frames from many calls to one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrunkFrame {
    /// Whether entries carry their own 16-bit timestamps.
    pub timestamps: bool,
    /// Transmission time base for the whole datagram.
    pub ts: u32,
    pub entries: Vec<TrunkEntry>,
}

impl TrunkFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(META_HDR_LEN + self.entries.len() * 24);
        out.extend_from_slice(&0u16.to_be_bytes());
        out.push(META_TRUNK);
        out.push(if self.timestamps { META_TRUNK_MINI } else { 0 });
        out.extend_from_slice(&self.ts.to_be_bytes());
        for e in &self.entries {
            append_trunk_entry(&mut out, self.timestamps, e);
        }
        out
    }

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        if data.len() < META_HDR_LEN {
            return Err(WireError::TooShort {
                need: META_HDR_LEN,
                have: data.len(),
            });
        }
        let metacmd = data[2];
        if metacmd != META_TRUNK {
            return Err(WireError::UnknownMeta(metacmd));
        }
        let timestamps = data[3] & META_TRUNK_MINI != 0;
        let ts = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let mut entries = Vec::new();
        let mut rest = &data[META_HDR_LEN..];
        while !rest.is_empty() {
            let (entry, used) = parse_trunk_entry(rest, timestamps)?;
            entries.push(entry);
            rest = &rest[used..];
        }
        Ok(TrunkFrame {
            timestamps,
            ts,
            entries,
        })
    }
}

/// Appends one entry in the given format. Used both by [`TrunkFrame::encode`]
/// and by the incremental trunk aggregation buffers.
pub fn append_trunk_entry(out: &mut Vec<u8>, timestamps: bool, entry: &TrunkEntry) {
    out.extend_from_slice(&entry.callno.to_be_bytes());
    if timestamps {
        out.extend_from_slice(&entry.ts.unwrap_or(0).to_be_bytes());
    }
    out.extend_from_slice(&(entry.payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&entry.payload);
}

/// Size one entry will occupy on the wire.
pub fn trunk_entry_len(timestamps: bool, payload_len: usize) -> usize {
    payload_len + if timestamps { 6 } else { 4 }
}

fn parse_trunk_entry(data: &[u8], timestamps: bool) -> WireResult<(TrunkEntry, usize)> {
    let hdr = if timestamps { 6 } else { 4 };
    if data.len() < hdr {
        return Err(WireError::BadTrunkEntry);
    }
    let callno = u16::from_be_bytes([data[0], data[1]]) & !FLAG_FULL;
    let (ts, len_off) = if timestamps {
        (Some(u16::from_be_bytes([data[2], data[3]])), 4)
    } else {
        (None, 2)
    };
    let len = u16::from_be_bytes([data[len_off], data[len_off + 1]]) as usize;
    if data.len() < hdr + len {
        return Err(WireError::BadTrunkEntry);
    }
    Ok((
        TrunkEntry {
            callno,
            ts,
            payload: data[hdr..hdr + len].to_vec(),
        },
        hdr + len,
    ))
}

/// Any parsed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Full(FullFrame),
    Mini(MiniFrame),
    Video(VideoFrame),
    Trunk(TrunkFrame),
}

impl Frame {
    /// Classifies and parses one UDP datagram.
    pub fn decode(data: &[u8]) -> WireResult<Frame> {
        if data.len() < MINI_HDR_LEN {
            return Err(WireError::TooShort {
                need: MINI_HDR_LEN,
                have: data.len(),
            });
        }
        let word0 = u16::from_be_bytes([data[0], data[1]]);
        if word0 & FLAG_FULL != 0 {
            return Ok(Frame::Full(FullFrame::decode(data)?));
        }
        if word0 == 0 {
            // Either a video mini frame or a meta frame; the video header's
            // call number keeps bit 15 set, which doubles as the tell.
            let word1 = u16::from_be_bytes([data[2], data[3]]);
            if word1 & FLAG_FULL != 0 {
                if data.len() < VIDEO_HDR_LEN {
                    return Err(WireError::TooShort {
                        need: VIDEO_HDR_LEN,
                        have: data.len(),
                    });
                }
                let tsword = u16::from_be_bytes([data[4], data[5]]);
                return Ok(Frame::Video(VideoFrame {
                    scallno: word1 & !FLAG_FULL,
                    ts: tsword & 0x7FFF,
                    mark: tsword & 0x8000 != 0,
                    payload: data[VIDEO_HDR_LEN..].to_vec(),
                }));
            }
            return Ok(Frame::Trunk(TrunkFrame::decode(data)?));
        }
        Ok(Frame::Mini(MiniFrame {
            scallno: word0,
            ts: u16::from_be_bytes([data[2], data[3]]),
            payload: data[MINI_HDR_LEN..].to_vec(),
        }))
    }

    /// The source call number claimed by the sender, where one exists.
    pub fn source_callno(&self) -> Option<u16> {
        match self {
            Frame::Full(f) => Some(f.scallno),
            Frame::Mini(f) => Some(f.scallno),
            Frame::Video(f) => Some(f.scallno),
            Frame::Trunk(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_frame_round_trip() {
        let f = FullFrame {
            scallno: 0x1234,
            dcallno: 0x0777,
            retrans: true,
            ts: 123_456,
            oseqno: 9,
            iseqno: 8,
            frametype: 6,
            csub: 1,
            payload: vec![11, 2, 0, 2],
        };
        let bytes = f.encode();
        assert_eq!(bytes[0] & 0x80, 0x80);
        assert_eq!(Frame::decode(&bytes).unwrap(), Frame::Full(f));
    }

    #[test]
    fn mini_frame_round_trip() {
        let f = MiniFrame {
            scallno: 0x0042,
            ts: 40_000,
            payload: vec![0u8; 20],
        };
        assert_eq!(Frame::decode(&f.encode()).unwrap(), Frame::Mini(f));
    }

    #[test]
    fn video_frame_round_trip() {
        let f = VideoFrame {
            scallno: 0x5000,
            ts: 0x7FFF,
            mark: true,
            payload: vec![1, 2, 3],
        };
        assert_eq!(Frame::decode(&f.encode()).unwrap(), Frame::Video(f));
    }

    #[test]
    fn short_datagram_rejected() {
        assert!(matches!(
            Frame::decode(&[0x80, 0x01, 0, 0]),
            Err(WireError::TooShort { .. })
        ));
    }

    #[test]
    fn unknown_meta_command_rejected() {
        let mut bytes = vec![0, 0, 9, 0];
        bytes.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(Frame::decode(&bytes), Err(WireError::UnknownMeta(9)));
    }
}
