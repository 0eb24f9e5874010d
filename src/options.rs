//! TLV option chain following a packet body when OPT_PRESENT is set.
//!
//! The chain is introduced by OPT_LENGTH (`type 0x00, length 4, total u16`)
//! and terminated by the high OPT_END bit on the last option's type byte:
//!
//! ```ascii
//! OPT_LENGTH:     0x00, 4, total_length (u16)
//! OPT_FRAGMENT:   0x01, 15, reserved (u8), first_sqn (u32), frag_off (u32), frag_len (u32)
//! OPT_NAK_LIST:   0x02, 3+4n, reserved (u8), sqn (u32) * n     (n <= 62)
//! OPT_PARITY_PRM: 0x08, 7, flags (u8), parity_prm_tgs (u32)
//! OPT_PARITY_GRP: 0x09, 7, reserved (u8), parity_group (u32)
//! ```
//!
//! Every option is bounds-checked against the TPDU tail before its body is
//! touched.

use crate::error::PgmError;
use crate::sqn::Sqn;
use bytes::BufMut;

pub const OPT_LENGTH: u8 = 0x00;
pub const OPT_FRAGMENT: u8 = 0x01;
pub const OPT_NAK_LIST: u8 = 0x02;
pub const OPT_PARITY_PRM: u8 = 0x08;
pub const OPT_PARITY_GRP: u8 = 0x09;
pub const OPT_END: u8 = 0x80;
pub const OPT_MASK: u8 = 0x7f;

/// OPT_PARITY_PRM flag bits
pub const PARITY_PRM_PRO: u8 = 0x02;
pub const PARITY_PRM_OND: u8 = 0x01;

/// set in the stripe's reserved byte to mark "no fragment option present"
/// when fragment metadata is Reed-Solomon encoded alongside parity payload
pub const OP_ENCODED_NULL: u8 = 0x80;

pub const OPT_LENGTH_LEN: usize = 4;
/// reserved + first_sqn + frag_off + frag_len
pub const FRAGMENT_STRIPE_LEN: usize = 13;
pub const OPT_FRAGMENT_LEN: usize = 2 + FRAGMENT_STRIPE_LEN;
/// full chain overhead of a fragmented ODATA: OPT_LENGTH + OPT_FRAGMENT
pub const FRAGMENT_CHAIN_LEN: usize = OPT_LENGTH_LEN + OPT_FRAGMENT_LEN;

pub const MAX_NAK_LIST_SQNS: usize = 62;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct OptFragment {
    pub first_sqn: Sqn,
    pub offset: u32,
    pub apdu_len: u32,
}

impl OptFragment {
    /// serialise into the 13-byte form used both on the wire and as the
    /// Reed-Solomon stripe over fragment metadata
    pub fn to_stripe(&self) -> [u8; FRAGMENT_STRIPE_LEN] {
        let mut stripe = [0u8; FRAGMENT_STRIPE_LEN];
        stripe[1..5].copy_from_slice(&self.first_sqn.to_raw().to_be_bytes());
        stripe[5..9].copy_from_slice(&self.offset.to_be_bytes());
        stripe[9..13].copy_from_slice(&self.apdu_len.to_be_bytes());
        stripe
    }

    /// the "encoded null" sentinel standing in for an absent option
    pub fn null_stripe() -> [u8; FRAGMENT_STRIPE_LEN] {
        let mut stripe = [0u8; FRAGMENT_STRIPE_LEN];
        stripe[0] = OP_ENCODED_NULL;
        stripe
    }

    /// decode a stripe; `None` when the sentinel marks an absent option
    pub fn from_stripe(stripe: &[u8; FRAGMENT_STRIPE_LEN]) -> Option<OptFragment> {
        if stripe[0] & OP_ENCODED_NULL != 0 {
            return None;
        }
        Some(OptFragment {
            first_sqn: Sqn::from_raw(u32::from_be_bytes([stripe[1], stripe[2], stripe[3], stripe[4]])),
            offset: u32::from_be_bytes([stripe[5], stripe[6], stripe[7], stripe[8]]),
            apdu_len: u32::from_be_bytes([stripe[9], stripe[10], stripe[11], stripe[12]]),
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ParityPrm {
    pub proactive: bool,
    pub ondemand: bool,
    pub group_size: u32,
}

#[derive(Default, Debug)]
pub struct ParsedOptions {
    /// bytes consumed by the whole chain, i.e. offset from chain start to payload
    pub total_length: u16,
    pub fragment: Option<OptFragment>,
    /// raw fragment stripe, kept for the parity decode path
    pub fragment_stripe: Option<[u8; FRAGMENT_STRIPE_LEN]>,
    pub nak_list: Vec<Sqn>,
    pub parity_prm: Option<ParityPrm>,
}

/// parse an option chain starting at `buf[0]` (the OPT_LENGTH option)
pub fn parse(buf: &[u8]) -> Result<ParsedOptions, PgmError> {
    if buf.len() < OPT_LENGTH_LEN {
        return Err(PgmError::Malformed("option chain shorter than OPT_LENGTH"));
    }
    if buf[0] != OPT_LENGTH {
        return Err(PgmError::Malformed("option chain does not start with OPT_LENGTH"));
    }
    if buf[1] as usize != OPT_LENGTH_LEN {
        return Err(PgmError::Malformed("OPT_LENGTH with bad length"));
    }
    let total_length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if total_length < OPT_LENGTH_LEN || total_length > buf.len() {
        return Err(PgmError::Malformed("option total length out of bounds"));
    }

    let mut parsed = ParsedOptions {
        total_length: total_length as u16,
        ..Default::default()
    };

    let mut offset = OPT_LENGTH_LEN;
    while offset < total_length {
        if total_length - offset < 2 {
            return Err(PgmError::Malformed("truncated option header"));
        }
        let opt_type = buf[offset];
        let opt_len = buf[offset + 1] as usize;
        if opt_len < 2 || offset + opt_len > total_length {
            return Err(PgmError::Malformed("option length out of bounds"));
        }
        let body = &buf[offset + 2..offset + opt_len];

        match opt_type & OPT_MASK {
            OPT_FRAGMENT => {
                if body.len() != FRAGMENT_STRIPE_LEN {
                    return Err(PgmError::Malformed("OPT_FRAGMENT with bad length"));
                }
                let mut stripe = [0u8; FRAGMENT_STRIPE_LEN];
                stripe.copy_from_slice(body);
                parsed.fragment = OptFragment::from_stripe(&stripe);
                parsed.fragment_stripe = Some(stripe);
            }
            OPT_NAK_LIST => {
                if body.is_empty() || (body.len() - 1) % 4 != 0 {
                    return Err(PgmError::Malformed("OPT_NAK_LIST with bad length"));
                }
                let count = (body.len() - 1) / 4;
                if count > MAX_NAK_LIST_SQNS {
                    return Err(PgmError::Malformed("OPT_NAK_LIST too long"));
                }
                parsed.nak_list = body[1..]
                    .chunks_exact(4)
                    .map(|c| Sqn::from_raw(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
                    .collect();
            }
            OPT_PARITY_PRM => {
                if body.len() != 5 {
                    return Err(PgmError::Malformed("OPT_PARITY_PRM with bad length"));
                }
                let prm_flags = body[0];
                if prm_flags & (PARITY_PRM_PRO | PARITY_PRM_OND) == 0 {
                    return Err(PgmError::Malformed("OPT_PARITY_PRM without mode"));
                }
                parsed.parity_prm = Some(ParityPrm {
                    proactive: prm_flags & PARITY_PRM_PRO != 0,
                    ondemand: prm_flags & PARITY_PRM_OND != 0,
                    group_size: u32::from_be_bytes([body[1], body[2], body[3], body[4]]),
                });
            }
            // recognised but carrying nothing the engine acts on
            OPT_PARITY_GRP => {}
            _ => {
                // unknown options are skipped, the length field carries us over
            }
        }

        if opt_type & OPT_END != 0 {
            break;
        }
        offset += opt_len;
    }

    Ok(parsed)
}

/// assembles an option chain; options are appended then written with the
/// correct OPT_LENGTH total and OPT_END marking in one pass
#[derive(Default)]
pub struct OptionsBuilder {
    opts: Vec<(u8, Vec<u8>)>,
}

impl OptionsBuilder {
    pub fn new() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    pub fn fragment(mut self, fragment: &OptFragment) -> OptionsBuilder {
        self.opts.push((OPT_FRAGMENT, fragment.to_stripe().to_vec()));
        self
    }

    /// a raw pre-encoded stripe, used on parity packets
    pub fn fragment_stripe(mut self, stripe: &[u8; FRAGMENT_STRIPE_LEN]) -> OptionsBuilder {
        self.opts.push((OPT_FRAGMENT, stripe.to_vec()));
        self
    }

    pub fn nak_list(mut self, sqns: &[Sqn]) -> OptionsBuilder {
        assert!(sqns.len() <= MAX_NAK_LIST_SQNS);
        let mut body = vec![0u8]; // reserved
        for sqn in sqns {
            body.extend_from_slice(&sqn.to_raw().to_be_bytes());
        }
        self.opts.push((OPT_NAK_LIST, body));
        self
    }

    pub fn parity_prm(mut self, proactive: bool, ondemand: bool, group_size: u32) -> OptionsBuilder {
        let mut body = vec![
            (if proactive { PARITY_PRM_PRO } else { 0 }) | (if ondemand { PARITY_PRM_OND } else { 0 }),
        ];
        body.extend_from_slice(&group_size.to_be_bytes());
        self.opts.push((OPT_PARITY_PRM, body));
        self
    }

    pub fn total_length(&self) -> u16 {
        let options: usize = self.opts.iter().map(|(_, body)| 2 + body.len()).sum();
        (OPT_LENGTH_LEN + options) as u16
    }

    pub fn build(self, buf: &mut impl BufMut) -> u16 {
        assert!(!self.opts.is_empty());
        let total = self.total_length();
        buf.put_u8(OPT_LENGTH);
        buf.put_u8(OPT_LENGTH_LEN as u8);
        buf.put_u16(total);
        let last = self.opts.len() - 1;
        for (i, (opt_type, body)) in self.opts.into_iter().enumerate() {
            buf.put_u8(if i == last { opt_type | OPT_END } else { opt_type });
            buf.put_u8((2 + body.len()) as u8);
            buf.put_slice(&body);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_fragment_round_trip() {
        let fragment = OptFragment {
            first_sqn: Sqn::from_raw(1000),
            offset: 2960,
            apdu_len: 10_000,
        };

        let mut buf = Vec::new();
        OptionsBuilder::new().fragment(&fragment).build(&mut buf);
        assert_eq!(buf.len(), FRAGMENT_CHAIN_LEN);
        assert_eq!(buf[4], OPT_FRAGMENT | OPT_END);

        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.total_length as usize, FRAGMENT_CHAIN_LEN);
        assert_eq!(parsed.fragment, Some(fragment));
        assert!(parsed.nak_list.is_empty());
    }

    #[test]
    fn test_nak_list_round_trip() {
        let sqns = (11u32..=20).map(Sqn::from_raw).collect::<Vec<_>>();

        let mut buf = Vec::new();
        OptionsBuilder::new().nak_list(&sqns).build(&mut buf);

        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.nak_list, sqns);
    }

    #[test]
    fn test_parity_prm_round_trip() {
        let mut buf = Vec::new();
        OptionsBuilder::new().parity_prm(true, false, 8).build(&mut buf);

        let parsed = parse(&buf).unwrap();
        assert_eq!(
            parsed.parity_prm,
            Some(ParityPrm { proactive: true, ondemand: false, group_size: 8 })
        );
    }

    #[test]
    fn test_multiple_options_end_bit_on_last() {
        let fragment = OptFragment { first_sqn: Sqn::ZERO, offset: 0, apdu_len: 5 };
        let mut buf = Vec::new();
        OptionsBuilder::new()
            .fragment(&fragment)
            .parity_prm(false, true, 4)
            .build(&mut buf);

        assert_eq!(buf[4] & OPT_END, 0);
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.fragment, Some(fragment));
        assert!(parsed.parity_prm.is_some());
    }

    #[test]
    fn test_null_stripe_sentinel() {
        let stripe = OptFragment::null_stripe();
        assert_eq!(OptFragment::from_stripe(&stripe), None);

        let mut buf = Vec::new();
        OptionsBuilder::new().fragment_stripe(&stripe).build(&mut buf);
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.fragment, None);
        assert_eq!(parsed.fragment_stripe, Some(stripe));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::not_opt_length(vec![0x01, 4, 0, 4])]
    #[case::bad_opt_length_len(vec![0x00, 5, 0, 4])]
    #[case::total_past_end(vec![0x00, 4, 0, 50])]
    #[case::truncated_option(vec![0x00, 4, 0, 6, 0x81])]
    #[case::option_past_total(vec![0x00, 4, 0, 8, 0x81, 30, 0, 0])]
    #[case::zero_length_option(vec![0x00, 4, 0, 8, 0x01, 0, 0, 0])]
    fn test_malformed(#[case] buf: Vec<u8>) {
        assert!(matches!(parse(&buf), Err(PgmError::Malformed(_))));
    }

    #[test]
    fn test_unknown_option_skipped() {
        // unknown type 0x05, then OPT_PARITY_PRM with END
        let mut buf = vec![0x00, 4, 0, 0, 0x05, 3, 0xaa, OPT_PARITY_PRM | OPT_END, 7, 1, 0, 0, 0, 4];
        let total = buf.len() as u16;
        buf[2..4].copy_from_slice(&total.to_be_bytes());

        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.parity_prm.unwrap().group_size, 4);
    }
}
