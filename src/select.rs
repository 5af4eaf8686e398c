//! ISO 7816 SELECT-by-name APDU parsing.
//!
//! The engine inspects every C-APDU it receives while no selection is
//! active (and every SELECT regardless) to decide whether it is a
//! SELECT-by-AID command it must dispatch itself, rather than forward to a
//! client.

/// `00 A4 04 xx` is SELECT, P1=04 (select by DF name) — the only SELECT
/// form edna recognises (spec.md §3). P2 (`xx`) is a wildcard: edna_comm.cpp
/// never inspects it, so any P2 value is accepted.
const SELECT_CLA: u8 = 0x00;
const SELECT_INS: u8 = 0xA4;
const SELECT_P1: u8 = 0x04;

/// Status word returned for a malformed SELECT (too short to carry a
/// length byte and AID), mirroring edna_comm.cpp's `apdu.size() < 5` check.
pub const SW_WRONG_LENGTH: [u8; 2] = [0x6F, 0x00];

/// Status word returned for any C-APDU reaching the engine while nothing is
/// selected and no client claims the AID (default "no such application").
pub const SW_NOT_FOUND: [u8; 2] = [0x6D, 0x00];

/// Parse a SELECT-by-AID command, returning the embedded AID bytes.
///
/// Returns `None` if `apdu` isn't a SELECT-by-name command at all (the
/// caller then treats it as ordinary data for whichever client is
/// currently selected). Returns `Some(Err(()))` only for `apdu.len < 5`,
/// the one case spec.md §4.2 calls malformed, mapped to [`SW_WRONG_LENGTH`]
/// and never forwarded. A well-formed-length SELECT with `Lc = 0` is not
/// malformed: it yields `Some(Ok(&[]))`, an AID that can't match any
/// registration, so the caller logs and falls through to forwarding the
/// APDU to whatever remains selected, per spec.md §4.2 step 2/3.
pub fn parse_select(apdu: &[u8]) -> Option<Result<&[u8], ()>> {
    if apdu.len() < 3 {
        return None;
    }
    if apdu[0] != SELECT_CLA || apdu[1] != SELECT_INS || apdu[2] != SELECT_P1 {
        return None;
    }
    if apdu.len() < 5 {
        return Some(Err(()));
    }
    let lc = apdu[4] as usize;
    let aid_start = 5;
    if apdu.len() < aid_start + lc {
        return Some(Err(()));
    }
    Some(Ok(&apdu[aid_start..aid_start + lc]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_well_formed_select() {
        let apdu = [0x00, 0xA4, 0x04, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(parse_select(&apdu), Some(Ok(&[0xDE, 0xAD, 0xBE, 0xEF][..])));
    }

    #[test]
    fn flags_too_short_select_as_malformed() {
        let apdu = [0x00, 0xA4, 0x04, 0x00];
        assert_eq!(parse_select(&apdu), Some(Err(())));
    }

    #[test]
    fn non_select_apdu_is_not_a_select() {
        let apdu = [0x00, 0xB0, 0x00, 0x00, 0x10];
        assert_eq!(parse_select(&apdu), None);
    }

    #[test]
    fn truncated_non_select_is_also_none() {
        assert_eq!(parse_select(&[0x00, 0xA4]), None);
    }

    #[test]
    fn p2_is_a_wildcard() {
        let apdu = [0x00, 0xA4, 0x04, 0x0C, 0x02, 0xAB, 0xCD];
        assert_eq!(parse_select(&apdu), Some(Ok(&[0xAB, 0xCD][..])));
    }

    #[test]
    fn zero_length_aid_is_well_formed_not_malformed() {
        let apdu = [0x00, 0xA4, 0x04, 0x00, 0x00];
        assert_eq!(parse_select(&apdu), Some(Ok(&[][..])));
    }
}
