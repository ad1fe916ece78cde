use proptest::prelude::*;

use iax2_transport::seq::{released_by, wanted_by_vnak, Seqno, SEQ_WINDOW};

proptest! {
    /// A frame is never both already-released and wanted for resend: the
    /// acknowledgment horizon and the VNAK window partition the space.
    #[test]
    fn release_and_vnak_partition(oseqno in any::<u8>(), iseqno in any::<u8>()) {
        let o = Seqno(oseqno);
        let i = Seqno(iseqno);
        prop_assert!(!(released_by(o, i) && wanted_by_vnak(o, i)));
        prop_assert!(released_by(o, i) || wanted_by_vnak(o, i));
    }

    #[test]
    fn release_covers_exactly_the_window(start in any::<u8>(), dist in 1u8..=SEQ_WINDOW) {
        let o = Seqno(start);
        let i = Seqno(start.wrapping_add(dist));
        prop_assert!(released_by(o, i));
    }

    #[test]
    fn nothing_self_releases(seq in any::<u8>()) {
        prop_assert!(!released_by(Seqno(seq), Seqno(seq)));
    }

    #[test]
    fn precedes_is_antisymmetric(a in any::<u8>(), b in any::<u8>()) {
        let (a, b) = (Seqno(a), Seqno(b));
        if a != b {
            prop_assert!(a.precedes(b) != b.precedes(a) || a.distance_to(b) == SEQ_WINDOW);
        }
    }
}
