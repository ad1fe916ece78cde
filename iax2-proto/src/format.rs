//! The legacy 64-bit media format bitfield.
//!
//! IAX2 negotiates codecs as bits in a fixed bitfield; the assignments are
//! wire-frozen. Only the subset below is named, everything else passes
//! through opaquely.

pub type FormatMask = u64;

pub const G723: FormatMask = 1 << 0;
pub const GSM: FormatMask = 1 << 1;
pub const ULAW: FormatMask = 1 << 2;
pub const ALAW: FormatMask = 1 << 3;
pub const G726_AAL2: FormatMask = 1 << 4;
pub const ADPCM: FormatMask = 1 << 5;
pub const SLIN: FormatMask = 1 << 6;
pub const LPC10: FormatMask = 1 << 7;
pub const G729: FormatMask = 1 << 8;
pub const SPEEX: FormatMask = 1 << 9;
pub const ILBC: FormatMask = 1 << 10;
pub const G726: FormatMask = 1 << 11;
pub const G722: FormatMask = 1 << 12;
pub const SIREN7: FormatMask = 1 << 13;
pub const SIREN14: FormatMask = 1 << 14;
pub const SLIN16: FormatMask = 1 << 15;
pub const JPEG: FormatMask = 1 << 16;
pub const PNG: FormatMask = 1 << 17;
pub const H261: FormatMask = 1 << 18;
pub const H263: FormatMask = 1 << 19;
pub const H263P: FormatMask = 1 << 20;
pub const H264: FormatMask = 1 << 21;
pub const MP4: FormatMask = 1 << 22;
pub const T140_RED: FormatMask = 1 << 26;
pub const T140: FormatMask = 1 << 27;
pub const G719: FormatMask = 1 << 32;
pub const SPEEX16: FormatMask = 1 << 33;
pub const OPUS: FormatMask = 1 << 34;
pub const TESTLAW: FormatMask = 1 << 47;

/// All audio format bits.
pub const AUDIO_MASK: FormatMask = G723
    | GSM
    | ULAW
    | ALAW
    | G726_AAL2
    | ADPCM
    | SLIN
    | LPC10
    | G729
    | SPEEX
    | ILBC
    | G726
    | G722
    | SIREN7
    | SIREN14
    | SLIN16
    | G719
    | SPEEX16
    | OPUS
    | TESTLAW;

/// All video format bits.
pub const VIDEO_MASK: FormatMask = JPEG | PNG | H261 | H263 | H263P | H264 | MP4;

/// Quality-ordered preference used when neither side supplies an explicit
/// preference list.
const BEST_ORDER: &[FormatMask] = &[
    ULAW, ALAW, G719, SIREN14, SIREN7, TESTLAW, G722, SLIN16, SLIN, OPUS, G726, ADPCM, G726_AAL2,
    GSM, ILBC, SPEEX16, SPEEX, LPC10, G729, G723,
];

/// Picks the best single format out of a mask, or 0 when the mask holds
/// nothing we can rank. Unranked bits fall back to the lowest set bit so an
/// exotic-only mask still yields something.
pub fn best_format(mask: FormatMask) -> FormatMask {
    for &f in BEST_ORDER {
        if mask & f != 0 {
            return f;
        }
    }
    if mask != 0 {
        1u64 << mask.trailing_zeros()
    } else {
        0
    }
}

/// The highest set bit of a mask. Used when preference lists are disabled and
/// negotiation falls back to raw bit priority.
pub fn highest_bit(mask: FormatMask) -> FormatMask {
    if mask == 0 {
        0
    } else {
        1u64 << (63 - mask.leading_zeros())
    }
}

pub fn name(format: FormatMask) -> &'static str {
    match format {
        G723 => "g723",
        GSM => "gsm",
        ULAW => "ulaw",
        ALAW => "alaw",
        G726_AAL2 => "g726aal2",
        ADPCM => "adpcm",
        SLIN => "slin",
        LPC10 => "lpc10",
        G729 => "g729",
        SPEEX => "speex",
        ILBC => "ilbc",
        G726 => "g726",
        G722 => "g722",
        SIREN7 => "siren7",
        SIREN14 => "siren14",
        SLIN16 => "slin16",
        JPEG => "jpeg",
        PNG => "png",
        H261 => "h261",
        H263 => "h263",
        H263P => "h263p",
        H264 => "h264",
        MP4 => "mpeg4",
        T140_RED => "red",
        T140 => "t140",
        G719 => "g719",
        SPEEX16 => "speex16",
        OPUS => "opus",
        TESTLAW => "testlaw",
        _ => "unknown",
    }
}

/// Renders a mask as a `(ulaw|alaw|...)` list for log output.
pub fn mask_to_string(mask: FormatMask) -> String {
    let mut out = String::from("(");
    let mut first = true;
    for bit in 0..64 {
        let f = 1u64 << bit;
        if mask & f != 0 {
            if !first {
                out.push('|');
            }
            out.push_str(name(f));
            first = false;
        }
    }
    if first {
        out.push_str("nothing");
    }
    out.push(')');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_prefers_ulaw() {
        assert_eq!(best_format(GSM | ULAW | G729), ULAW);
    }

    #[test]
    fn best_of_empty_is_zero() {
        assert_eq!(best_format(0), 0);
    }

    #[test]
    fn unranked_bits_still_pick_something() {
        assert_eq!(best_format(H264), H264);
    }

    #[test]
    fn highest_bit_picks_msb() {
        assert_eq!(highest_bit(ULAW | SLIN16), SLIN16);
    }
}
