//! Packet-type-specific bodies that follow the PGM header. Network layer
//! addresses travel in AFI form: `afi (u16), reserved (u16), address`.
//!
//! ```ascii
//! SPM:         spm_sqn (u32), spm_trail (u32), spm_lead (u32), path NLA
//! NAK / NCF:   nak_sqn (u32), source NLA, group NLA
//! ODATA/RDATA: data_sqn (u32), data_trail (u32), tsdu...
//! SPMR:        no body
//! ```

use crate::error::PgmError;
use crate::sqn::Sqn;
use bytes::{Buf, BufMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const AFI_IP: u16 = 1;
const AFI_IP6: u16 = 2;

fn ser_nla(addr: IpAddr, buf: &mut impl BufMut) {
    match addr {
        IpAddr::V4(v4) => {
            buf.put_u16(AFI_IP);
            buf.put_u16(0);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u16(AFI_IP6);
            buf.put_u16(0);
            buf.put_slice(&v6.octets());
        }
    }
}

fn deser_nla(buf: &mut impl Buf) -> Result<IpAddr, PgmError> {
    if buf.remaining() < 4 {
        return Err(PgmError::Malformed("truncated nla"));
    }
    let afi = buf.get_u16();
    let _reserved = buf.get_u16();
    match afi {
        AFI_IP => {
            if buf.remaining() < 4 {
                return Err(PgmError::Malformed("truncated ipv4 nla"));
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        AFI_IP6 => {
            if buf.remaining() < 16 {
                return Err(PgmError::Malformed("truncated ipv6 nla"));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(PgmError::Malformed("unknown nla afi")),
    }
}

/// Source Path Message: advertises window edges and the path back to the
/// source for unicast NAKs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpmBody {
    pub spm_sqn: Sqn,
    pub trail: Sqn,
    pub lead: Sqn,
    pub path_nla: IpAddr,
}

impl SpmBody {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.spm_sqn.to_raw());
        buf.put_u32(self.trail.to_raw());
        buf.put_u32(self.lead.to_raw());
        ser_nla(self.path_nla, buf);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<SpmBody, PgmError> {
        if buf.remaining() < 12 {
            return Err(PgmError::Malformed("short spm"));
        }
        let spm_sqn = Sqn::from_raw(buf.get_u32());
        let trail = Sqn::from_raw(buf.get_u32());
        let lead = Sqn::from_raw(buf.get_u32());
        let path_nla = deser_nla(buf)?;
        Ok(SpmBody { spm_sqn, trail, lead, path_nla })
    }
}

/// NAK and NCF share one body: the (first) requested sequence number plus
/// the source and group NLAs the request is scoped to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NakBody {
    pub sqn: Sqn,
    pub src_nla: IpAddr,
    pub grp_nla: IpAddr,
}

impl NakBody {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sqn.to_raw());
        ser_nla(self.src_nla, buf);
        ser_nla(self.grp_nla, buf);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<NakBody, PgmError> {
        if buf.remaining() < 4 {
            return Err(PgmError::Malformed("short nak"));
        }
        let sqn = Sqn::from_raw(buf.get_u32());
        let src_nla = deser_nla(buf)?;
        let grp_nla = deser_nla(buf)?;
        Ok(NakBody { sqn, src_nla, grp_nla })
    }
}

/// leading eight bytes of every ODATA/RDATA body
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub sqn: Sqn,
    pub trail: Sqn,
}

impl DataHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sqn.to_raw());
        buf.put_u32(self.trail.to_raw());
    }

    pub fn deser(buf: &mut impl Buf) -> Result<DataHeader, PgmError> {
        if buf.remaining() < 8 {
            return Err(PgmError::Malformed("short data header"));
        }
        Ok(DataHeader {
            sqn: Sqn::from_raw(buf.get_u32()),
            trail: Sqn::from_raw(buf.get_u32()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::v4(IpAddr::V4(Ipv4Addr::new(10, 6, 28, 33)))]
    #[case::v6(IpAddr::V6(Ipv6Addr::LOCALHOST))]
    fn test_spm_round_trip(#[case] nla: IpAddr) {
        let spm = SpmBody {
            spm_sqn: Sqn::from_raw(3210),
            trail: Sqn::from_raw(1),
            lead: Sqn::from_raw(44),
            path_nla: nla,
        };
        let mut buf = Vec::new();
        spm.ser(&mut buf);
        assert_eq!(SpmBody::deser(&mut buf.as_slice()).unwrap(), spm);
    }

    #[test]
    fn test_spm_wire_layout_v4() {
        let spm = SpmBody {
            spm_sqn: Sqn::from_raw(1),
            trail: Sqn::from_raw(2),
            lead: Sqn::from_raw(3),
            path_nla: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        };
        let mut buf = Vec::new();
        spm.ser(&mut buf);
        assert_eq!(buf, vec![0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 1, 0, 0, 10, 0, 0, 1]);
    }

    #[rstest]
    #[case::v4(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 2)), IpAddr::V4(Ipv4Addr::new(239, 192, 0, 1)))]
    #[case::v6(IpAddr::V6(Ipv6Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::new(0xff08, 0, 0, 0, 0, 0, 0, 1)))]
    fn test_nak_round_trip(#[case] src: IpAddr, #[case] grp: IpAddr) {
        let nak = NakBody { sqn: Sqn::from_raw(100), src_nla: src, grp_nla: grp };
        let mut buf = Vec::new();
        nak.ser(&mut buf);
        assert_eq!(NakBody::deser(&mut buf.as_slice()).unwrap(), nak);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short_sqn(vec![0, 0])]
    #[case::bad_afi(vec![0, 0, 0, 100, 0, 9, 0, 0, 1, 2, 3, 4])]
    #[case::truncated_addr(vec![0, 0, 0, 100, 0, 1, 0, 0, 1, 2])]
    fn test_nak_malformed(#[case] buf: Vec<u8>) {
        assert!(matches!(
            NakBody::deser(&mut buf.as_slice()),
            Err(PgmError::Malformed(_))
        ));
    }

    #[test]
    fn test_data_header_round_trip() {
        let data = DataHeader { sqn: Sqn::from_raw(9), trail: Sqn::from_raw(4) };
        let mut buf = Vec::new();
        data.ser(&mut buf);
        assert_eq!(buf.len(), 8);
        assert_eq!(DataHeader::deser(&mut buf.as_slice()).unwrap(), data);
    }
}
