//! Payload layouts shared with the sensor-node firmware.
//!
//! Nodes broadcast a compact manufacturer-specific advertisement and expose
//! the same reading layout through the Reading characteristic and its
//! notifications. Both are fixed little-endian layouts.

/// Length of the manufacturer-specific advertisement payload.
pub const ADV_PAYLOAD_LEN: usize = 17;

/// Length of an encoded reading value.
pub const READING_PAYLOAD_LEN: usize = 9;

pub const FAULT_SENSOR_HIGH: u8 = 0x01;
pub const FAULT_SENSOR_LOW: u8 = 0x02;
pub const FAULT_SENSOR_DISCONNECTED: u8 = 0x04;
pub const FAULT_ADC_SATURATION: u8 = 0x08;
pub const FAULT_LOW_BATTERY: u8 = 0x10;
pub const FAULT_WATCHDOG_RESET: u8 = 0x20;
pub const FAULT_CONFIG_CORRUPT: u8 = 0x40;

/// Advertisement payload broadcast by a sensor node.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeAdvertisement {
    pub company_id: u16,
    pub version: u8,
    pub node_id: [u8; 6],
    pub battery_percent: u8,
    pub last_reading: f32,
    pub fault_flags: u8,
    /// Increments on every sample; lets the hub spot stale rebroadcasts.
    pub counter: u16,
}

/// Parses an advertisement payload. Returns `None` on short or garbled
/// input; unparseable advertisements are not an error, the scanner sees
/// plenty of foreign traffic.
pub fn parse_advertisement(data: &[u8]) -> Option<NodeAdvertisement> {
    if data.len() < ADV_PAYLOAD_LEN {
        return None;
    }
    let mut node_id = [0u8; 6];
    node_id.copy_from_slice(&data[3..9]);
    Some(NodeAdvertisement {
        company_id: u16::from_le_bytes([data[0], data[1]]),
        version: data[2],
        node_id,
        battery_percent: data[9],
        last_reading: f32::from_le_bytes([data[10], data[11], data[12], data[13]]),
        fault_flags: data[14],
        counter: u16::from_le_bytes([data[15], data[16]]),
    })
}

/// Encodes an advertisement payload into `buf`.
pub fn encode_advertisement(adv: &NodeAdvertisement, buf: &mut [u8; ADV_PAYLOAD_LEN]) {
    buf[0..2].copy_from_slice(&adv.company_id.to_le_bytes());
    buf[2] = adv.version;
    buf[3..9].copy_from_slice(&adv.node_id);
    buf[9] = adv.battery_percent;
    buf[10..14].copy_from_slice(&adv.last_reading.to_le_bytes());
    buf[14] = adv.fault_flags;
    buf[15..17].copy_from_slice(&adv.counter.to_le_bytes());
}

/// Value layout of the Reading characteristic.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reading {
    pub timestamp: u32,
    pub value: f32,
    pub quality: u8,
}

pub fn parse_reading(data: &[u8]) -> Option<Reading> {
    if data.len() < READING_PAYLOAD_LEN {
        return None;
    }
    Some(Reading {
        timestamp: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        value: f32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        quality: data[8],
    })
}

pub fn encode_reading(reading: &Reading, buf: &mut [u8; READING_PAYLOAD_LEN]) {
    buf[0..4].copy_from_slice(&reading.timestamp.to_le_bytes());
    buf[4..8].copy_from_slice(&reading.value.to_le_bytes());
    buf[8] = reading.quality;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertisement_round_trip() {
        let adv = NodeAdvertisement {
            company_id: 0x068a,
            version: 1,
            node_id: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            battery_percent: 87,
            last_reading: 42.5,
            fault_flags: FAULT_LOW_BATTERY,
            counter: 1234,
        };
        let mut buf = [0u8; ADV_PAYLOAD_LEN];
        encode_advertisement(&adv, &mut buf);
        assert_eq!(parse_advertisement(&buf), Some(adv));
    }

    #[test]
    fn advertisement_too_short() {
        assert_eq!(parse_advertisement(&[0u8; ADV_PAYLOAD_LEN - 1]), None);
        assert_eq!(parse_advertisement(&[]), None);
    }

    #[test]
    fn reading_round_trip() {
        let r = Reading {
            timestamp: 1_700_000_000,
            value: -3.25,
            quality: 0x03,
        };
        let mut buf = [0u8; READING_PAYLOAD_LEN];
        encode_reading(&r, &mut buf);
        assert_eq!(parse_reading(&buf), Some(r));
        assert_eq!(parse_reading(&buf[..8]), None);
    }
}
