use serde::{Deserialize, Serialize};

/// Modbus function code used by every query the battery answers.
pub const FUNCTION_READ: u8 = 0x03;

const QUERY_LENGTH: usize = 8;

/// Highest battery address captured in the checksum tables below.
pub const MAX_ADDRESS: u8 = 14;

// The two checksum bytes of each query are opaque constants transcribed from
// bus captures of the vendor tooling. The algorithm behind them is not part
// of this crate; new addresses need new captures.
const BLOCK_CHECKSUMS: [[u8; 2]; MAX_ADDRESS as usize] = [
    [0x44, 0x06],
    [0x44, 0x35],
    [0x45, 0xe4],
    [0x44, 0x53],
    [0x45, 0x82],
    [0x45, 0xb1],
    [0x44, 0x60],
    [0x44, 0x9f],
    [0x45, 0x4e],
    [0x45, 0x7d],
    [0x44, 0xac],
    [0x45, 0x1b],
    [0x44, 0xca],
    [0x44, 0xf9],
];
const CELLS_CHECKSUMS: [[u8; 2]; MAX_ADDRESS as usize] = [
    [0xc4, 0x0e],
    [0xc4, 0x3d],
    [0xc5, 0xec],
    [0xc4, 0x5b],
    [0xc5, 0x8a],
    [0xc5, 0xb9],
    [0xc4, 0x68],
    [0xc4, 0x97],
    [0xc5, 0x46],
    [0xc5, 0x75],
    [0xc4, 0xa4],
    [0xc5, 0x13],
    [0xc4, 0xc2],
    [0xc4, 0xf1],
];
const TEMPERATURE_CHECKSUMS: [[u8; 2]; MAX_ADDRESS as usize] = [
    [0xc4, 0x10],
    [0xc4, 0x23],
    [0xc5, 0xf2],
    [0xc4, 0x45],
    [0xc5, 0x94],
    [0xc5, 0xa7],
    [0xc4, 0x76],
    [0xc4, 0x89],
    [0xc5, 0x58],
    [0xc5, 0x6b],
    [0xc4, 0xba],
    [0xc5, 0x0d],
    [0xc4, 0xdc],
    [0xc4, 0xef],
];
const EXTRA_TEMPERATURE_CHECKSUMS: [[u8; 2]; MAX_ADDRESS as usize] = [
    [0x94, 0x20],
    [0x94, 0x13],
    [0x95, 0xc2],
    [0x94, 0x75],
    [0x95, 0xa4],
    [0x95, 0x97],
    [0x94, 0x46],
    [0x94, 0xb9],
    [0x95, 0x68],
    [0x95, 0x5b],
    [0x94, 0x8a],
    [0x95, 0x3d],
    [0x94, 0xec],
    [0x94, 0xdf],
];

/// Bus address of one battery pack, 1..=[`MAX_ADDRESS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(u8);

impl Address {
    pub fn new(address: u8) -> Option<Self> {
        if (1..=MAX_ADDRESS).contains(&address) {
            Some(Self(address))
        } else {
            None
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    fn table_index(&self) -> usize {
        usize::from(self.0) - 1
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn build_query(
    address: Address,
    register: u16,
    count: u16,
    checksum: [u8; 2],
) -> [u8; QUERY_LENGTH] {
    let register = register.to_be_bytes();
    let count = count.to_be_bytes();
    [
        address.get(),
        FUNCTION_READ,
        register[0],
        register[1],
        count[0],
        count[1],
        checksum[0],
        checksum[1],
    ]
}

fn validate_len(buffer: &[u8], reply_size: usize) -> Option<()> {
    if buffer.len() != reply_size {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            reply_size,
            buffer.len()
        );
        return None;
    }
    Some(())
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn u16_at(buffer: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buffer[offset], buffer[offset + 1]])
}

/// Sensor scaling shared by the main and extra temperature registers.
fn scale_temperature(raw: u16) -> f64 {
    round1((f64::from(raw) - 726.0) * 0.1 + 22.6)
}

/// Pack-level reading from the block voltage registers.
///
/// Decoding is all-or-nothing: a frame either yields every field or none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockReading {
    pub voltage: f64,
    pub current: f64, // negative=charging, positive=discharging
    pub soc: f64,
    pub cycle: u16,
    pub power: f64,
}

impl BlockReading {
    pub fn request(address: Address) -> [u8; QUERY_LENGTH] {
        build_query(
            address,
            0x0000,
            0x0010,
            BLOCK_CHECKSUMS[address.table_index()],
        )
    }

    pub fn reply_size() -> usize {
        37
    }

    pub fn decode(rx_buffer: &[u8]) -> Option<Self> {
        validate_len(rx_buffer, Self::reply_size())?;
        // Current is transmitted as two's complement; values at or above
        // 0x8000 wrap negative.
        let mut current_raw = i32::from(u16_at(rx_buffer, 3));
        if current_raw >= 0x8000 {
            current_raw -= 0x10000;
        }
        let current = round2(f64::from(current_raw) / 100.0);
        let voltage = round2(f64::from(u16_at(rx_buffer, 5)) / 100.0);
        let soc = round1(f64::from(u16_at(rx_buffer, 7)) / 10.0);
        let cycle = u16_at(rx_buffer, 17);
        Some(Self {
            voltage,
            current,
            soc,
            cycle,
            power: round2(current * voltage),
        })
    }
}

/// Number of cells reported per pack.
pub const CELL_COUNT: usize = 16;

pub struct CellVoltages;

impl CellVoltages {
    pub fn request(address: Address) -> [u8; QUERY_LENGTH] {
        build_query(
            address,
            0x0028,
            0x0010,
            CELLS_CHECKSUMS[address.table_index()],
        )
    }

    pub fn reply_size() -> usize {
        37
    }

    /// Decodes the 16 raw cell voltages (millivolt scalars, unscaled).
    ///
    /// The first byte of a cell frame echoes the polled address; a frame
    /// answered by another pack on the bus is discarded here.
    pub fn decode(rx_buffer: &[u8], address: Address) -> Option<[u16; CELL_COUNT]> {
        validate_len(rx_buffer, Self::reply_size())?;
        if rx_buffer[0] != address.get() {
            log::warn!(
                "Misaddressed cell frame - polled={} answered={}",
                address,
                rx_buffer[0]
            );
            return None;
        }
        let mut cells = [0u16; CELL_COUNT];
        for (i, cell) in cells.iter_mut().enumerate() {
            *cell = u16_at(rx_buffer, 3 + 2 * i);
        }
        Some(cells)
    }
}

pub struct Temperatures;

impl Temperatures {
    pub fn request(address: Address) -> [u8; QUERY_LENGTH] {
        build_query(
            address,
            0x0078,
            0x0004,
            TEMPERATURE_CHECKSUMS[address.table_index()],
        )
    }

    pub fn reply_size() -> usize {
        13
    }

    /// Decodes up to four probe temperatures in degrees Celsius.
    pub fn decode(rx_buffer: &[u8]) -> Option<Vec<f64>> {
        validate_len(rx_buffer, Self::reply_size())?;
        // 3 header bytes in front, 2 checksum bytes behind.
        let payload = &rx_buffer[3..rx_buffer.len() - 2];
        if payload.len() % 2 != 0 {
            log::debug!(
                "Odd temperature payload length {} - dropping trailing byte",
                payload.len()
            );
        }
        Some(
            payload
                .chunks_exact(2)
                .map(|pair| scale_temperature(u16::from_be_bytes([pair[0], pair[1]])))
                .collect(),
        )
    }
}

pub struct ExtraTemperatures;

impl ExtraTemperatures {
    pub fn request(address: Address) -> [u8; QUERY_LENGTH] {
        build_query(
            address,
            0x0091,
            0x000a,
            EXTRA_TEMPERATURE_CHECKSUMS[address.table_index()],
        )
    }

    pub fn reply_size() -> usize {
        25
    }

    /// Decodes the MOS and environment temperatures, in that order.
    pub fn decode(rx_buffer: &[u8]) -> Option<(f64, f64)> {
        validate_len(rx_buffer, Self::reply_size())?;
        let mos = scale_temperature(u16_at(rx_buffer, 3));
        let env = scale_temperature(u16_at(rx_buffer, 5));
        Some((mos, env))
    }
}

/// Prebuilt query frames for one battery address.
///
/// Polling iterates over a table of these instead of hand-written
/// per-battery byte literals.
#[derive(Debug, Clone)]
pub struct BatteryQueries {
    pub address: Address,
    pub block: [u8; QUERY_LENGTH],
    pub cells: [u8; QUERY_LENGTH],
    pub temperature: [u8; QUERY_LENGTH],
    pub extra_temperature: [u8; QUERY_LENGTH],
}

impl BatteryQueries {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            block: BlockReading::request(address),
            cells: CellVoltages::request(address),
            temperature: Temperatures::request(address),
            extra_temperature: ExtraTemperatures::request(address),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn addr(n: u8) -> Address {
        Address::new(n).unwrap()
    }

    pub fn block_frame(current: u16, voltage: u16, soc: u16, cycle: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 37];
        frame[0] = 0x01;
        frame[1] = FUNCTION_READ;
        frame[3..5].copy_from_slice(&current.to_be_bytes());
        frame[5..7].copy_from_slice(&voltage.to_be_bytes());
        frame[7..9].copy_from_slice(&soc.to_be_bytes());
        frame[17..19].copy_from_slice(&cycle.to_be_bytes());
        frame
    }

    pub fn cells_frame(address: u8, cells: &[u16; CELL_COUNT]) -> Vec<u8> {
        let mut frame = vec![0u8; 37];
        frame[0] = address;
        frame[1] = FUNCTION_READ;
        for (i, cell) in cells.iter().enumerate() {
            frame[3 + 2 * i..5 + 2 * i].copy_from_slice(&cell.to_be_bytes());
        }
        frame
    }

    pub fn temperature_frame(raw: &[u16]) -> Vec<u8> {
        assert!(raw.len() <= 4);
        let mut frame = vec![0u8; 13];
        frame[0] = 0x01;
        frame[1] = FUNCTION_READ;
        for (i, value) in raw.iter().enumerate() {
            frame[3 + 2 * i..5 + 2 * i].copy_from_slice(&value.to_be_bytes());
        }
        frame
    }

    pub fn extra_frame(mos: u16, env: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 25];
        frame[0] = 0x01;
        frame[1] = FUNCTION_READ;
        frame[3..5].copy_from_slice(&mos.to_be_bytes());
        frame[5..7].copy_from_slice(&env.to_be_bytes());
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn address_range() {
        assert!(Address::new(0).is_none());
        assert!(Address::new(1).is_some());
        assert!(Address::new(14).is_some());
        assert!(Address::new(15).is_none());
    }

    #[test]
    fn queries_match_captured_literals() {
        assert_eq!(
            BlockReading::request(addr(1)),
            [0x01, 0x03, 0x00, 0x00, 0x00, 0x10, 0x44, 0x06]
        );
        assert_eq!(
            CellVoltages::request(addr(2)),
            [0x02, 0x03, 0x00, 0x28, 0x00, 0x10, 0xc4, 0x3d]
        );
        assert_eq!(
            Temperatures::request(addr(3)),
            [0x03, 0x03, 0x00, 0x78, 0x00, 0x04, 0xc5, 0xf2]
        );
        assert_eq!(
            ExtraTemperatures::request(addr(14)),
            [0x0e, 0x03, 0x00, 0x91, 0x00, 0x0a, 0x94, 0xdf]
        );
    }

    #[test]
    fn block_decode_positive_current() {
        let reading = BlockReading::decode(&block_frame(0x0140, 5399, 874, 121)).unwrap();
        assert_eq!(reading.current, 3.2);
        assert_eq!(reading.voltage, 53.99);
        assert_eq!(reading.soc, 87.4);
        assert_eq!(reading.cycle, 121);
        assert_eq!(reading.power, 172.77);
    }

    #[test]
    fn block_decode_negative_current() {
        // 0xFF38 is -200 in two's complement
        let reading = BlockReading::decode(&block_frame(0xff38, 5120, 500, 7)).unwrap();
        assert_eq!(reading.current, -2.0);
        assert_eq!(reading.voltage, 51.2);
        assert_eq!(reading.power, -102.4);
    }

    #[test]
    fn block_decode_signed_boundary() {
        let positive = BlockReading::decode(&block_frame(0x7fff, 5000, 500, 0)).unwrap();
        assert_eq!(positive.current, 327.67);
        let negative = BlockReading::decode(&block_frame(0x8000, 5000, 500, 0)).unwrap();
        assert_eq!(negative.current, -327.68);
    }

    #[test]
    fn block_decode_round_trip() {
        for (current, voltage, soc, cycle) in [
            (0, 4000, 0, 0),
            (0x0140, 5399, 874, 121),
            (0xff38, 6000, 1000, 65535),
        ] {
            let reading = BlockReading::decode(&block_frame(current, voltage, soc, cycle)).unwrap();
            let mut expected_current = i32::from(current);
            if expected_current >= 0x8000 {
                expected_current -= 0x10000;
            }
            assert_eq!(reading.current, f64::from(expected_current) / 100.0);
            assert_eq!(reading.voltage, f64::from(voltage) / 100.0);
            assert_eq!(reading.soc, f64::from(soc) / 10.0);
            assert_eq!(reading.cycle, cycle);
        }
    }

    #[test]
    fn block_decode_rejects_wrong_length() {
        assert!(BlockReading::decode(&[]).is_none());
        assert!(BlockReading::decode(&vec![0u8; 36]).is_none());
        assert!(BlockReading::decode(&vec![0u8; 38]).is_none());
    }

    #[test]
    fn cells_decode() {
        let mut raw = [3300u16; CELL_COUNT];
        raw[0] = 3291;
        raw[15] = 3312;
        let cells = CellVoltages::decode(&cells_frame(1, &raw), addr(1)).unwrap();
        assert_eq!(cells, raw);
    }

    #[test]
    fn cells_decode_rejects_misaddressed_frame() {
        let raw = [3300u16; CELL_COUNT];
        assert!(CellVoltages::decode(&cells_frame(2, &raw), addr(1)).is_none());
        assert!(CellVoltages::decode(&cells_frame(1, &raw), addr(1)).is_some());
    }

    #[test]
    fn temperature_decode() {
        // raw 826 -> (826-726)*0.1+22.6 = 32.6
        let temps = Temperatures::decode(&temperature_frame(&[826, 726, 500, 1050])).unwrap();
        assert_eq!(temps, vec![32.6, 22.6, 0.0, 55.0]);
    }

    #[test]
    fn temperature_decode_rejects_wrong_length() {
        assert!(Temperatures::decode(&vec![0u8; 12]).is_none());
        assert!(Temperatures::decode(&vec![0u8; 37]).is_none());
    }

    #[test]
    fn extra_temperature_decode() {
        let (mos, env) = ExtraTemperatures::decode(&extra_frame(826, 776)).unwrap();
        assert_eq!(mos, 32.6);
        assert_eq!(env, 27.6);
    }

    #[test]
    fn battery_queries_table() {
        let queries = BatteryQueries::new(addr(5));
        assert_eq!(
            queries.block,
            [0x05, 0x03, 0x00, 0x00, 0x00, 0x10, 0x45, 0x82]
        );
        assert_eq!(queries.cells[0], 0x05);
        assert_eq!(queries.temperature[0], 0x05);
        assert_eq!(queries.extra_temperature[0], 0x05);
    }
}
