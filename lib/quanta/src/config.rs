//! Configuration registry: global defaults, per-object overrides, and the
//! sizes derived from the configured MTU.

use std::sync::Arc;

use photon::time::Usec;

use crate::shared::{
    StatusChanged, DATA_PKT_HEADER_SIZE, DEFAULT_MTU_PACKET_SIZE, MIN_MTU_PACKET_SIZE, SEND_RATE_CEILING,
    SEND_RATE_FLOOR,
};

pub type StatusChangedCallback = Arc<dyn Fn(&StatusChanged) + Send + Sync>;

/// Recognized configuration keys for the integer-valued registry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ConfigKey {
    SendBufferSize,
    SendRateMin,
    SendRateMax,
    NagleTime,
    TimeoutInitial,
    TimeoutConnected,
    MtuPacketSize,
    Unencrypted,
    SymmetricConnect,
    IpAllowWithoutAuth,
    ClientConsecutivePingTimeoutsFailInitial,
    ClientConsecutivePingTimeoutsFail,
    LogLevelPacket,
    LogLevelMessage,
    FakePacketLossSend,
    FakePacketLossRecv,
    FakePacketLagSend,
    FakePacketLagRecv,
    FakePacketReorderSend,
    FakePacketReorderRecv,
    FakePacketReorderTime,
    FakePacketDupSend,
    FakePacketDupRecv,
    FakePacketDupTimeMax,
    FakeRateLimitSendRate,
    FakeRateLimitSendBurst,
    FakeRateLimitRecvRate,
    FakeRateLimitRecvBurst,
    PacketTraceMaxBytes,
    OutOfOrderCorrectionWindowMicroseconds,
}

/// Sizes derived from the MTU.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MtuSizes {
    pub mtu_pkt_size: usize,
    /// Room for ciphertext + tag in one datagram.
    pub max_encrypted_payload: usize,
    /// Room for frames after the AEAD tag.
    pub max_plaintext_payload: usize,
    /// Largest message that never fragments.
    pub max_message_no_fragment: usize,
    /// Cap on one reliable segment, so retries always fit a fresh packet.
    pub max_reliable_segment: usize,
}

const AEAD_TAG_SIZE: usize = 16;
/// Worst-case unreliable segment header: lead, absolute message number,
/// offset varint, size byte.
const UNRELIABLE_SEG_MAX_HEADER: usize = 1 + 4 + 5 + 1;
/// Worst-case reliable segment header plus the stop-waiting frame that
/// shares every packet.
const RELIABLE_SEG_RESERVE: usize = (1 + 6 + 1) + (1 + 8);
/// Ceiling imposed by the size-byte encoding.
const MAX_SIZE_BYTE_SEGMENT: usize = 0x4ff;

impl MtuSizes {
    pub fn for_mtu(mtu_pkt_size: usize) -> MtuSizes {
        let mtu_pkt_size = mtu_pkt_size.max(MIN_MTU_PACKET_SIZE);
        let max_encrypted_payload = mtu_pkt_size - DATA_PKT_HEADER_SIZE;
        let max_plaintext_payload = max_encrypted_payload - AEAD_TAG_SIZE;
        MtuSizes {
            mtu_pkt_size,
            max_encrypted_payload,
            max_plaintext_payload,
            max_message_no_fragment: max_plaintext_payload - UNRELIABLE_SEG_MAX_HEADER,
            max_reliable_segment: (max_plaintext_payload - RELIABLE_SEG_RESERVE).min(MAX_SIZE_BYTE_SEGMENT),
        }
    }
}

/// One resolved set of configuration values. The global set provides the
/// defaults; listen sockets and connections clone it and apply overrides.
#[derive(Clone)]
pub struct ConfigValues {
    pub send_buffer_size: usize,
    pub send_rate_min: usize,
    pub send_rate_max: usize,
    pub nagle_time: Usec,
    pub timeout_initial_ms: i64,
    pub timeout_connected_ms: i64,
    pub mtu_packet_size: usize,
    /// 0 = encryption required .. 3 = plaintext required.
    pub unencrypted: i64,
    pub symmetric_connect: bool,
    pub ip_allow_without_auth: bool,
    pub ping_timeouts_fail_initial: u32,
    pub ping_timeouts_fail: u32,
    pub log_level_packet: i64,
    pub log_level_message: i64,
    pub fake_packet_loss_send: i64,
    pub fake_packet_loss_recv: i64,
    pub fake_packet_lag_send: i64,
    pub fake_packet_lag_recv: i64,
    pub fake_packet_reorder_send: i64,
    pub fake_packet_reorder_recv: i64,
    pub fake_packet_reorder_time: i64,
    pub fake_packet_dup_send: i64,
    pub fake_packet_dup_recv: i64,
    pub fake_packet_dup_time_max: i64,
    pub fake_rate_limit_send_rate: i64,
    pub fake_rate_limit_send_burst: i64,
    pub fake_rate_limit_recv_rate: i64,
    pub fake_rate_limit_recv_burst: i64,
    pub packet_trace_max_bytes: i64,
    pub out_of_order_correction_window: Usec,
    pub status_changed_callback: Option<StatusChangedCallback>,
}

impl Default for ConfigValues {
    fn default() -> ConfigValues {
        ConfigValues {
            send_buffer_size: 512 * 1024,
            send_rate_min: 128 * 1024,
            send_rate_max: 1024 * 1024,
            nagle_time: 5_000,
            timeout_initial_ms: 10_000,
            timeout_connected_ms: 10_000,
            mtu_packet_size: DEFAULT_MTU_PACKET_SIZE,
            unencrypted: 0,
            symmetric_connect: false,
            ip_allow_without_auth: true,
            ping_timeouts_fail_initial: 5,
            ping_timeouts_fail: 4,
            log_level_packet: 0,
            log_level_message: 0,
            fake_packet_loss_send: 0,
            fake_packet_loss_recv: 0,
            fake_packet_lag_send: 0,
            fake_packet_lag_recv: 0,
            fake_packet_reorder_send: 0,
            fake_packet_reorder_recv: 0,
            fake_packet_reorder_time: 15,
            fake_packet_dup_send: 0,
            fake_packet_dup_recv: 0,
            fake_packet_dup_time_max: 10,
            fake_rate_limit_send_rate: 0,
            fake_rate_limit_send_burst: 0,
            fake_rate_limit_recv_rate: 0,
            fake_rate_limit_recv_burst: 0,
            packet_trace_max_bytes: 0,
            out_of_order_correction_window: 1_000,
            status_changed_callback: None,
        }
    }
}

impl ConfigValues {
    /// Sets an integer-valued key. Returns false for out-of-range values.
    pub fn set_int(&mut self, key: ConfigKey, value: i64) -> bool {
        if value < 0 {
            return false;
        }
        match key {
            ConfigKey::SendBufferSize => self.send_buffer_size = value as usize,
            ConfigKey::SendRateMin => self.send_rate_min = value as usize,
            ConfigKey::SendRateMax => self.send_rate_max = value as usize,
            ConfigKey::NagleTime => self.nagle_time = value,
            ConfigKey::TimeoutInitial => self.timeout_initial_ms = value,
            ConfigKey::TimeoutConnected => self.timeout_connected_ms = value,
            ConfigKey::MtuPacketSize => {
                if (value as usize) < MIN_MTU_PACKET_SIZE {
                    return false;
                }
                self.mtu_packet_size = value as usize;
            }
            ConfigKey::Unencrypted => {
                if value > 3 {
                    return false;
                }
                self.unencrypted = value;
            }
            ConfigKey::SymmetricConnect => self.symmetric_connect = value != 0,
            ConfigKey::IpAllowWithoutAuth => self.ip_allow_without_auth = value != 0,
            ConfigKey::ClientConsecutivePingTimeoutsFailInitial => self.ping_timeouts_fail_initial = value as u32,
            ConfigKey::ClientConsecutivePingTimeoutsFail => self.ping_timeouts_fail = value as u32,
            ConfigKey::LogLevelPacket => self.log_level_packet = value,
            ConfigKey::LogLevelMessage => self.log_level_message = value,
            ConfigKey::FakePacketLossSend => self.fake_packet_loss_send = value.min(100),
            ConfigKey::FakePacketLossRecv => self.fake_packet_loss_recv = value.min(100),
            ConfigKey::FakePacketLagSend => self.fake_packet_lag_send = value,
            ConfigKey::FakePacketLagRecv => self.fake_packet_lag_recv = value,
            ConfigKey::FakePacketReorderSend => self.fake_packet_reorder_send = value.min(100),
            ConfigKey::FakePacketReorderRecv => self.fake_packet_reorder_recv = value.min(100),
            ConfigKey::FakePacketReorderTime => self.fake_packet_reorder_time = value,
            ConfigKey::FakePacketDupSend => self.fake_packet_dup_send = value.min(100),
            ConfigKey::FakePacketDupRecv => self.fake_packet_dup_recv = value.min(100),
            ConfigKey::FakePacketDupTimeMax => self.fake_packet_dup_time_max = value,
            ConfigKey::FakeRateLimitSendRate => self.fake_rate_limit_send_rate = value,
            ConfigKey::FakeRateLimitSendBurst => self.fake_rate_limit_send_burst = value,
            ConfigKey::FakeRateLimitRecvRate => self.fake_rate_limit_recv_rate = value,
            ConfigKey::FakeRateLimitRecvBurst => self.fake_rate_limit_recv_burst = value,
            ConfigKey::PacketTraceMaxBytes => self.packet_trace_max_bytes = value,
            ConfigKey::OutOfOrderCorrectionWindowMicroseconds => self.out_of_order_correction_window = value,
        }
        true
    }

    /// Effective send rate: the configured maximum clamped to the legal
    /// band. Applied on every token-bucket refill.
    pub fn effective_send_rate(&self) -> usize {
        self.send_rate_max
            .max(self.send_rate_min)
            .clamp(SEND_RATE_FLOOR, SEND_RATE_CEILING)
    }

    #[inline]
    pub fn mtu(&self) -> MtuSizes {
        MtuSizes::for_mtu(self.mtu_packet_size)
    }

    #[inline]
    pub fn timeout_initial(&self) -> Usec {
        self.timeout_initial_ms * 1_000
    }

    #[inline]
    pub fn timeout_connected(&self) -> Usec {
        self.timeout_connected_ms * 1_000
    }

    /// Cipher preference list by the `unencrypted` policy, most preferred
    /// first.
    pub fn cipher_preferences(&self) -> &'static [crate::shared::Cipher] {
        use crate::shared::Cipher::{Aes256Gcm, Null};
        match self.unencrypted {
            0 => &[Aes256Gcm],
            1 => &[Aes256Gcm, Null],
            2 => &[Null, Aes256Gcm],
            _ => &[Null],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::Cipher;

    #[test]
    fn test_mtu_derivation() {
        let sizes = MtuSizes::for_mtu(DEFAULT_MTU_PACKET_SIZE);
        assert_eq!(sizes.max_encrypted_payload, 1293);
        assert_eq!(sizes.max_plaintext_payload, 1277);
        assert!(sizes.max_message_no_fragment < sizes.max_plaintext_payload);
        assert!(sizes.max_reliable_segment < sizes.max_plaintext_payload);
        assert!(sizes.max_reliable_segment <= MAX_SIZE_BYTE_SEGMENT);

        // Tiny MTUs are floored.
        let floored = MtuSizes::for_mtu(50);
        assert_eq!(floored.mtu_pkt_size, MIN_MTU_PACKET_SIZE);
    }

    #[test]
    fn test_set_int_bounds() {
        let mut config = ConfigValues::default();
        assert!(config.set_int(ConfigKey::SendRateMax, 2_000_000));
        assert_eq!(config.send_rate_max, 2_000_000);
        assert!(!config.set_int(ConfigKey::Unencrypted, 4));
        assert!(!config.set_int(ConfigKey::NagleTime, -1));
        assert!(!config.set_int(ConfigKey::MtuPacketSize, 100));
        assert!(config.set_int(ConfigKey::FakePacketLossSend, 150));
        assert_eq!(config.fake_packet_loss_send, 100);
    }

    #[test]
    fn test_effective_rate_clamped() {
        let mut config = ConfigValues::default();
        config.send_rate_max = 1;
        assert_eq!(config.effective_send_rate(), SEND_RATE_FLOOR.max(config.send_rate_min));
        config.send_rate_min = 0;
        config.send_rate_max = usize::MAX;
        assert_eq!(config.effective_send_rate(), SEND_RATE_CEILING);
    }

    #[test]
    fn test_cipher_preferences() {
        let mut config = ConfigValues::default();
        assert_eq!(config.cipher_preferences(), &[Cipher::Aes256Gcm]);
        config.set_int(ConfigKey::Unencrypted, 1);
        assert_eq!(config.cipher_preferences(), &[Cipher::Aes256Gcm, Cipher::Null]);
        config.set_int(ConfigKey::Unencrypted, 3);
        assert_eq!(config.cipher_preferences(), &[Cipher::Null]);
    }
}
