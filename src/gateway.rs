use crate::Error;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

// RS485 adapters need time to switch between TX and RX.
pub const MINIMUM_DELAY: Duration = Duration::from_millis(4);

const DEFAULT_BAUD_RATE: u32 = 9600;

enum Connection {
    Serial(Box<dyn serialport::SerialPort>),
    Tcp(TcpStream),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Connection::Serial(serial) => {
                write!(f, "Serial({})", serial.name().unwrap_or_default())
            }
            Connection::Tcp(stream) => write!(f, "Tcp({:?})", stream.peer_addr()),
        }
    }
}

/// The single shared connection to the battery bus.
///
/// All batteries answer on the same wire, so exchanges are strictly
/// sequential: send one query, read one reply, with an enforced minimum
/// delay in between. A stalled exchange is bounded by the read timeout.
#[derive(Debug)]
pub struct Gateway {
    connection: Connection,
    last_exchange: Instant,
    delay: Duration,
}

impl Gateway {
    pub fn open_serial(port: &str, baud_rate: Option<u32>) -> Result<Self, Error> {
        let serial = serialport::new(port, baud_rate.unwrap_or(DEFAULT_BAUD_RATE))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;
        Ok(Self::from_connection(Connection::Serial(serial)))
    }

    pub fn open_tcp(host: &str, port: u16, connect_timeout: Duration) -> Result<Self, Error> {
        let address = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address for {host}:{port}"),
            )
        })?;
        let stream = TcpStream::connect_timeout(&address, connect_timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self::from_connection(Connection::Tcp(stream)))
    }

    fn from_connection(connection: Connection) -> Self {
        Self {
            connection,
            last_exchange: Instant::now(),
            delay: MINIMUM_DELAY,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        match &mut self.connection {
            Connection::Serial(serial) => serial.set_timeout(timeout)?,
            Connection::Tcp(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
            }
        }
        Ok(())
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Duration::max(delay, MINIMUM_DELAY);
    }

    fn await_delay(&self) {
        let since_last = Instant::now().duration_since(self.last_exchange);
        if let Some(remaining) = self.delay.checked_sub(since_last) {
            std::thread::sleep(remaining);
        }
    }

    // Stale bytes from a previous (timed out or misrouted) answer must not
    // be read back as this query's reply.
    fn drain_input(&mut self) -> Result<(), Error> {
        if let Connection::Serial(serial) = &mut self.connection {
            let pending = serial.bytes_to_read()?;
            if pending > 0 {
                log::trace!("Discarding {pending} pending bytes");
                serial.clear(serialport::ClearBuffer::Input)?;
            }
        }
        Ok(())
    }

    fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<(), Error> {
        self.drain_input()?;
        self.await_delay();
        log::trace!("send_bytes: {:02X?}", tx_buffer);
        match &mut self.connection {
            Connection::Serial(serial) => serial.write_all(tx_buffer)?,
            Connection::Tcp(stream) => stream.write_all(tx_buffer)?,
        }
        Ok(())
    }

    fn receive_bytes(&mut self, size: usize) -> Result<Vec<u8>, Error> {
        let mut rx_buffer = vec![0; size];
        match &mut self.connection {
            Connection::Serial(serial) => serial.read_exact(&mut rx_buffer)?,
            Connection::Tcp(stream) => stream.read_exact(&mut rx_buffer)?,
        }
        self.last_exchange = Instant::now();
        log::trace!("receive_bytes: {:02X?}", rx_buffer);
        Ok(rx_buffer)
    }

    /// One query/reply exchange, reading exactly `reply_size` bytes.
    pub fn exchange(&mut self, query: &[u8], reply_size: usize) -> Result<Vec<u8>, Error> {
        self.send_bytes(query)?;
        self.receive_bytes(reply_size)
    }

    /// Like [`Self::exchange`], but a failed or timed out exchange becomes
    /// an absent frame. The decode pipeline treats missing data as routine;
    /// the next poll cycle is the retry.
    pub fn fetch(&mut self, query: &[u8], reply_size: usize) -> Option<Vec<u8>> {
        match self.exchange(query, reply_size) {
            Ok(rx_buffer) => Some(rx_buffer),
            Err(err) => {
                log::warn!("Exchange failed for query {:02X?}: {err}", query);
                None
            }
        }
    }
}
