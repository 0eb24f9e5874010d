//! A Pragmatic General Multicast (RFC 3208) transport engine: reliable
//! one-to-many delivery over IP multicast with negative-acknowledgement
//! repair and optional Reed-Solomon forward error correction.
//!
//! ## Design overview
//!
//! * One sender multiplexes a stream of application messages (APDUs) onto a
//!   multicast group; each receiver reassembles its own in-order view.
//!   * APDUs larger than one packet are fragmented with OPT_FRAGMENT and
//!     reassembled on commit; a lost fragment drops the whole APDU.
//! * Reliability is receiver-driven: the default is to assume delivery and
//!   repair by exception.
//!   * a gap in the sequence space arms a randomised back-off; the NAK is
//!     unicast to the source, confirmed with a multicast NCF and answered
//!     with RDATA. Unconfirmed or unanswered NAKs are retried a bounded
//!     number of times, then the hole is sealed and the reader skips it.
//!   * NAKs from sibling receivers on the segment suppress our own.
//! * The source advertises liveness and window edges with Source Path
//!   Messages on two overlapping cadences: a slow ambient period and a
//!   decaying heartbeat ramp after each data burst.
//! * Optional FEC groups `k` consecutive packets into a transmission group
//!   and repairs up to `h = n - k` losses per group with parity packets,
//!   either proactively or generated on demand from a single parity NAK.
//! * Receivers learn sources lazily from their traffic; a silent source
//!   expires along with its receive window.
//!
//! ## Wire format
//!
//! Every TPDU starts with the 16-byte PGM header (network byte order):
//!
//! ```ascii
//! 0:  source port (u16)
//! 2:  destination port (u16)
//! 4:  type (u8): SPM 0x00, ODATA 0x04, RDATA 0x05, NAK 0x08, NNAK 0x09,
//!      NCF 0x0a, SPMR 0x0c
//! 5:  option flags (u8): OPT_PARITY 0x80, OPT_VAR_PKTLEN 0x40,
//!      OPT_NETWORK 0x02, OPT_PRESENT 0x01
//! 6:  checksum (u16): 16-bit ones-complement over header and body;
//!      0 = unchecked, accepted for SPMs only
//! 8:  global source identifier (6 bytes)
//! 14: tsdu length (u16)
//! ```
//!
//! The type-specific body follows, then (with OPT_PRESENT) a TLV option
//! chain introduced by OPT_LENGTH and terminated by the OPT_END bit; see
//! [`options`] for the recognised options.
//!
//! Sequence numbers are 32-bit serial numbers; comparisons wrap, so a
//! window never sees more than half the sequence space at once.
//!
//! ## Out of scope
//!
//! Raw sockets, IP header handling, multicast group membership and
//! interface selection live behind [`send_pipeline::PgmSocket`]; byte-level
//! Reed-Solomon behind [`fec::FecCodec`]; rate regulation behind
//! [`rate::RateLimiter`]. There is no congestion control beyond the
//! configured rate limit and no cryptographic authentication.

pub mod checksum;
pub mod config;
pub mod control_messages;
pub mod error;
pub mod fec;
pub mod options;
pub mod packet_header;
pub mod peer;
pub mod rate;
pub mod rxw;
pub mod send_pipeline;
pub mod sqn;
pub mod stats;
pub mod tsi;
pub mod txw;

mod receiver;
mod source;
mod timer;
mod transport;

pub use config::{FecConfig, TransportConfig};
pub use error::{PgmError, PgmResult};
pub use sqn::Sqn;
pub use transport::{registered_transports, Transport};
pub use tsi::{Gsi, Tsi};
