//! The fixed 16-byte PGM header shared by every TPDU, network byte order:
//!
//! ```ascii
//! 0:  source port (u16)
//! 2:  destination port (u16)
//! 4:  packet type (u8)
//! 5:  option flags (u8)
//! 6:  checksum (u16), ones-complement over header+body, 0 = unchecked
//! 8:  global source id (6 bytes)
//! 14: tsdu length (u16) - payload bytes carried by this TPDU
//! ```

use crate::checksum;
use crate::error::PgmError;
use crate::tsi::Gsi;
use bytes::{Buf, BufMut};

pub const PGM_HEADER_LEN: usize = 16;
/// sequence number + trailing edge prefix of ODATA/RDATA bodies
pub const DATA_HEADER_LEN: usize = 8;

/// `options` bits of the PGM header
pub mod flags {
    /// TPDU carries parity rather than original data
    pub const OPT_PARITY: u8 = 0x80;
    /// parity TPDU covers a variable-packet-length transmission group
    pub const OPT_VAR_PKTLEN: u8 = 0x40;
    /// options chain is network-significant
    pub const OPT_NETWORK: u8 = 0x02;
    /// a TLV option chain follows the packet body
    pub const OPT_PRESENT: u8 = 0x01;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PacketType {
    Spm,
    Polr,
    Odata,
    Rdata,
    Nak,
    Nnak,
    Ncf,
    Spmr,
}

impl PacketType {
    pub fn from_wire(value: u8) -> Result<PacketType, PgmError> {
        Ok(match value {
            0x00 => PacketType::Spm,
            0x02 => PacketType::Polr,
            0x04 => PacketType::Odata,
            0x05 => PacketType::Rdata,
            0x08 => PacketType::Nak,
            0x09 => PacketType::Nnak,
            0x0a => PacketType::Ncf,
            0x0c => PacketType::Spmr,
            _ => return Err(PgmError::Malformed("unknown packet type")),
        })
    }

    pub fn to_wire(self) -> u8 {
        match self {
            PacketType::Spm => 0x00,
            PacketType::Polr => 0x02,
            PacketType::Odata => 0x04,
            PacketType::Rdata => 0x05,
            PacketType::Nak => 0x08,
            PacketType::Nnak => 0x09,
            PacketType::Ncf => 0x0a,
            PacketType::Spmr => 0x0c,
        }
    }

    /// source-to-receivers traffic
    pub fn is_downstream(self) -> bool {
        matches!(
            self,
            PacketType::Spm | PacketType::Odata | PacketType::Rdata | PacketType::Ncf
        )
    }

    /// receiver-to-source traffic
    pub fn is_upstream(self) -> bool {
        matches!(
            self,
            PacketType::Nak | PacketType::Nnak | PacketType::Spmr | PacketType::Polr
        )
    }

    /// receiver-to-receiver traffic (multicast NAK suppression, SPMR squelch)
    pub fn is_peer(self) -> bool {
        matches!(self, PacketType::Nak | PacketType::Spmr)
    }
}

#[derive(Clone, Debug)]
pub struct PgmHeader {
    pub sport: u16,
    pub dport: u16,
    pub typ: PacketType,
    pub options: u8,
    pub checksum: u16,
    pub gsi: Gsi,
    pub tsdu_length: u16,
}

impl PgmHeader {
    pub fn new(typ: PacketType, gsi: Gsi, sport: u16, dport: u16) -> PgmHeader {
        PgmHeader {
            sport,
            dport,
            typ,
            options: 0,
            checksum: 0,
            gsi,
            tsdu_length: 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.sport);
        buf.put_u16(self.dport);
        buf.put_u8(self.typ.to_wire());
        buf.put_u8(self.options);
        buf.put_u16(self.checksum);
        buf.put_slice(self.gsi.as_bytes());
        buf.put_u16(self.tsdu_length);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<PgmHeader, PgmError> {
        if buf.remaining() < PGM_HEADER_LEN {
            return Err(PgmError::Malformed("short pgm header"));
        }
        let sport = buf.get_u16();
        let dport = buf.get_u16();
        let typ = PacketType::from_wire(buf.get_u8())?;
        let options = buf.get_u8();
        let checksum = buf.get_u16();
        let mut gsi = [0u8; 6];
        buf.copy_to_slice(&mut gsi);
        let tsdu_length = buf.get_u16();
        Ok(PgmHeader {
            sport,
            dport,
            typ,
            options,
            checksum,
            gsi: Gsi::from_bytes(gsi),
            tsdu_length,
        })
    }

    pub fn has_option(&self, flag: u8) -> bool {
        self.options & flag != 0
    }
}

/// compute the checksum over a fully assembled TPDU and store it in place
pub fn finalize_checksum(tpdu: &mut [u8]) {
    tpdu[6] = 0;
    tpdu[7] = 0;
    let cs = checksum::fold(checksum::partial(tpdu, 0));
    tpdu[6] = (cs >> 8) as u8;
    tpdu[7] = cs as u8;
}

/// verify an incoming TPDU; a zero checksum is accepted for SPMs only
pub fn verify_checksum(tpdu: &[u8], typ: PacketType) -> Result<(), PgmError> {
    let stored = u16::from_be_bytes([tpdu[6], tpdu[7]]);
    if stored == 0 {
        return if typ == PacketType::Spm {
            Ok(())
        } else {
            Err(PgmError::ChecksumError)
        };
    }
    if checksum::is_valid(tpdu) {
        Ok(())
    } else {
        Err(PgmError::ChecksumError)
    }
}
