use proptest::prelude::*;

use iax2_proto::frame::{Frame, FullFrame, MiniFrame, TrunkEntry, TrunkFrame};
use iax2_proto::ies::{build_ies, parse_ies, Ie};
use iax2_proto::subclass;

proptest! {
    #[test]
    fn subclass_round_trip_powers(k in 0u32..63) {
        let v = 1i64 << k;
        let c = subclass::compress(v).unwrap();
        prop_assert_eq!(subclass::uncompress(c), v);
    }

    #[test]
    fn subclass_round_trip_literals(v in 0i64..0x80) {
        let c = subclass::compress(v).unwrap();
        prop_assert_eq!(subclass::uncompress(c), v);
    }

    #[test]
    fn full_frame_round_trip(
        scallno in 0u16..0x8000,
        dcallno in 0u16..0x8000,
        retrans in any::<bool>(),
        ts in any::<u32>(),
        oseqno in any::<u8>(),
        iseqno in any::<u8>(),
        frametype in 1u8..13,
        csub in any::<u8>(),
        payload in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let f = FullFrame {
            scallno, dcallno, retrans, ts, oseqno, iseqno, frametype, csub,
            payload,
        };
        prop_assert_eq!(Frame::decode(&f.encode()).unwrap(), Frame::Full(f));
    }

    #[test]
    fn mini_frame_round_trip(
        scallno in 1u16..0x8000,
        ts in any::<u16>(),
        payload in prop::collection::vec(any::<u8>(), 0..160),
    ) {
        let f = MiniFrame { scallno, ts, payload };
        prop_assert_eq!(Frame::decode(&f.encode()).unwrap(), Frame::Mini(f));
    }

    #[test]
    fn trunk_frame_round_trip(
        timestamps in any::<bool>(),
        ts in any::<u32>(),
        entries in prop::collection::vec(
            (1u16..0x8000, any::<u16>(), prop::collection::vec(any::<u8>(), 0..40)),
            0..8,
        ),
    ) {
        let f = TrunkFrame {
            timestamps,
            ts,
            entries: entries
                .into_iter()
                .map(|(callno, ets, payload)| TrunkEntry {
                    callno,
                    ts: timestamps.then_some(ets),
                    payload,
                })
                .collect(),
        };
        prop_assert_eq!(Frame::decode(&f.encode()).unwrap(), Frame::Trunk(f));
    }

    #[test]
    fn string_ie_round_trip(s in "[ -~]{0,80}") {
        let ies = vec![Ie::CalledNumber(s)];
        prop_assert_eq!(parse_ies(&build_ies(&ies)).unwrap(), ies);
    }

    #[test]
    fn unknown_ie_round_trip(id in 60u8..255, data in prop::collection::vec(any::<u8>(), 0..40)) {
        let ies = vec![Ie::Unknown { ie: id, data }];
        prop_assert_eq!(parse_ies(&build_ies(&ies)).unwrap(), ies);
    }
}
