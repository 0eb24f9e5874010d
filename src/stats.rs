//! Cumulative statistics counters, readable from the control surface.
//! Wire-level failures are recovered locally and show up here rather than
//! as errors on the caller's path.

/// counters of the sending side, owned by the source state
#[derive(Default, Debug, Clone)]
pub struct SourceStats {
    pub bytes_sent: u64,
    pub data_bytes_sent: u64,
    pub data_msgs_sent: u64,
    pub selective_naks_received: u64,
    pub parity_naks_received: u64,
    pub malformed_naks: u64,
    pub nnak_packets_received: u64,
    pub nnaks_received: u64,
    pub nnak_errors: u64,
    pub selective_bytes_retransmitted: u64,
    pub selective_msgs_retransmitted: u64,
    pub parity_bytes_retransmitted: u64,
    pub parity_msgs_retransmitted: u64,
    pub spms_sent: u64,
    pub packets_discarded: u64,
    pub cksum_errors: u64,
}

/// counters of the receiving side, kept per peer
#[derive(Default, Debug, Clone)]
pub struct ReceiverStats {
    pub bytes_received: u64,
    pub data_bytes_received: u64,
    pub data_msgs_received: u64,
    pub msgs_received: u64,
    pub dup_spms: u64,
    pub dup_datas: u64,
    pub malformed_spms: u64,
    pub malformed_odata: u64,
    pub malformed_rdata: u64,
    pub malformed_ncfs: u64,
    pub nak_errors: u64,
    pub packets_discarded: u64,
    pub selective_nak_packets_sent: u64,
    pub selective_naks_sent: u64,
    pub parity_nak_packets_sent: u64,
    pub parity_naks_sent: u64,
    pub spmrs_sent: u64,
    pub naks_suppressed: u64,
    pub naks_failed_ncf_retries_exceeded: u64,
    pub naks_failed_data_retries_exceeded: u64,
    pub apdus_lost: u64,
}
