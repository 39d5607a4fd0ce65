//! Telemetry wire format for the data uplink.

use crate::gps::Fix;
use crate::modem::BatteryStatus;

/// Encoded size of one telemetry record.
pub const PACKET_LEN: usize = 46;

/// One fixed-layout telemetry record, sent as a raw little-endian byte block
/// over the TCP session.
#[derive(Clone, Copy, Debug, PartialEq, defmt::Format)]
pub struct TelemetryPacket {
    pub latitude: f64,
    pub longitude: f64,
    pub course_deg: f64,
    pub speed_mps: f64,
    pub hdop: u16,
    pub fix_age_secs: u16,
    pub satellites: u8,
    pub battery_voltage: f64,
    pub battery_percent: u8,
}

impl TelemetryPacket {
    pub fn from_parts(fix: &Fix, now_ms: u32, battery: BatteryStatus) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            course_deg: fix.course_deg,
            speed_mps: fix.speed_mps,
            hdop: fix.hdop,
            fix_age_secs: fix.age_secs(now_ms),
            satellites: fix.satellites,
            battery_voltage: battery.voltage,
            battery_percent: battery.percent,
        }
    }

    /// Field order and widths are what the receiver expects; keep in sync
    /// with the ingest side.
    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let mut out = [0u8; PACKET_LEN];
        out[0..8].copy_from_slice(&self.latitude.to_le_bytes());
        out[8..16].copy_from_slice(&self.longitude.to_le_bytes());
        out[16..24].copy_from_slice(&self.course_deg.to_le_bytes());
        out[24..32].copy_from_slice(&self.speed_mps.to_le_bytes());
        out[32..34].copy_from_slice(&self.hdop.to_le_bytes());
        out[34..36].copy_from_slice(&self.fix_age_secs.to_le_bytes());
        out[36] = self.satellites;
        out[37..45].copy_from_slice(&self.battery_voltage.to_le_bytes());
        out[45] = self.battery_percent;
        out
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn sample() -> TelemetryPacket {
        TelemetryPacket {
            latitude: 52.520008,
            longitude: 13.404954,
            course_deg: 271.5,
            speed_mps: 4.2,
            hdop: 125,
            fix_age_secs: 3,
            satellites: 9,
            battery_voltage: 3.95,
            battery_percent: 73,
        }
    }

    #[test]
    fn layout_matches_the_receiver() {
        let bytes = sample().encode();

        assert_eq!(bytes.len(), PACKET_LEN);
        assert_eq!(&bytes[0..8], &52.520008_f64.to_le_bytes());
        assert_eq!(&bytes[8..16], &13.404954_f64.to_le_bytes());
        assert_eq!(&bytes[16..24], &271.5_f64.to_le_bytes());
        assert_eq!(&bytes[24..32], &4.2_f64.to_le_bytes());
        assert_eq!(&bytes[32..34], &125_u16.to_le_bytes());
        assert_eq!(&bytes[34..36], &3_u16.to_le_bytes());
        assert_eq!(bytes[36], 9);
        assert_eq!(&bytes[37..45], &3.95_f64.to_le_bytes());
        assert_eq!(bytes[45], 73);
    }

    #[test]
    fn from_parts_derives_age_from_the_clock() {
        let fix = Fix {
            timestamp_ms: 10_000,
            latitude: 1.0,
            longitude: 2.0,
            hdop: 200,
            course_deg: 0.0,
            speed_mps: 0.0,
            satellites: 5,
        };
        let battery = BatteryStatus {
            percent: 80,
            voltage: 4.1,
        };

        let packet = TelemetryPacket::from_parts(&fix, 17_500, battery);
        assert_eq!(packet.fix_age_secs, 7);
        assert_eq!(packet.battery_percent, 80);
    }
}
