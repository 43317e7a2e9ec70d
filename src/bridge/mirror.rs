//! Modbus/TCP view of the sensor readings.
//!
//! One unit id, one contiguous holding register block sized from the
//! register map. TCP clients may only read; the table is written by the
//! poller alone, one whole map entry per lock so a client never sees a
//! half-updated entry.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rmodbus::{
    consts::ModbusFunction,
    server::{context::ModbusContext, storage::ModbusStorage, ModbusFrame},
    ErrorKind, ModbusProto,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::{JoinHandle, JoinSet},
};

/// Holding registers only, covering the whole 16-bit address space.
type MirrorStorage = ModbusStorage<0, 0, 0, 65536>;

const MBAP_HEADER_LEN: usize = 7;
const MAX_ADU_LEN: usize = 260;

pub struct ModbusMirror {
    unit_id: u8,
    capacity: u16,
    storage: Mutex<Box<MirrorStorage>>,
}

impl ModbusMirror {
    pub fn new(unit_id: u8, capacity: u16) -> Arc<Self> {
        log::info!("holding register block 0..{capacity} for unit {unit_id}");
        Arc::new(Self {
            unit_id,
            capacity,
            storage: Mutex::new(Box::new(MirrorStorage::new())),
        })
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Replace `values.len()` registers starting at `offset` in one step.
    pub fn set_values(&self, offset: u16, values: &[u16]) -> Result<()> {
        self.check_range(offset, values.len())?;
        let mut storage = self.storage.lock();
        for (i, value) in values.iter().enumerate() {
            storage
                .set_holding(offset + i as u16, *value)
                .map_err(|e| anyhow!("Failed to set holding {}: {e:?}", offset as usize + i))?;
        }
        Ok(())
    }

    pub fn get_values(&self, offset: u16, count: u16) -> Result<Vec<u16>> {
        self.check_range(offset, count as usize)?;
        let storage = self.storage.lock();
        (offset..offset + count)
            .map(|addr| {
                storage
                    .get_holding(addr)
                    .map_err(|e| anyhow!("Failed to get holding {addr}: {e:?}"))
            })
            .collect()
    }

    fn check_range(&self, offset: u16, count: usize) -> Result<()> {
        if offset as usize + count > self.capacity as usize {
            return Err(anyhow!(
                "registers {offset}..{} outside table of {} words",
                offset as usize + count,
                self.capacity
            ));
        }
        Ok(())
    }

    /// Process one Modbus/TCP request ADU and build the response ADU.
    ///
    /// Requests for other unit ids produce no response. Anything but a
    /// holding register read inside the table gets an exception reply.
    pub fn process_request(&self, request: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut response = Vec::new();
        let respond = {
            let mut frame = ModbusFrame::new(self.unit_id, request, ModbusProto::TcpUdp, &mut response);
            frame
                .parse()
                .map_err(|e| anyhow!("Invalid Modbus/TCP frame: {e:?}"))?;

            if frame.processing_required {
                if !frame.readonly || !matches!(frame.func, ModbusFunction::GetHoldings) {
                    frame
                        .set_modbus_error_if_unset(&ErrorKind::IllegalFunction)
                        .map_err(|e| anyhow!("{e:?}"))?;
                } else if frame.reg as u32 + frame.count as u32 > self.capacity as u32 {
                    frame
                        .set_modbus_error_if_unset(&ErrorKind::IllegalDataAddress)
                        .map_err(|e| anyhow!("{e:?}"))?;
                } else {
                    let storage = self.storage.lock();
                    if frame.process_read(&**storage).is_err() {
                        return Err(anyhow!("Frame processing error"));
                    }
                }
            }

            if frame.response_required {
                frame
                    .finalize_response()
                    .map_err(|e| anyhow!("Failed to finalize response: {e:?}"))?;
                true
            } else {
                false
            }
        };
        Ok(respond.then_some(response))
    }

    async fn serve_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut adu = [0u8; MAX_ADU_LEN];
        loop {
            if let Err(err) = stream.read_exact(&mut adu[..MBAP_HEADER_LEN]).await {
                log::debug!("client {peer} disconnected: {err}");
                return Ok(());
            }
            // length field counts the unit id plus the PDU
            let length = u16::from_be_bytes([adu[4], adu[5]]) as usize;
            if length < 2 || MBAP_HEADER_LEN - 1 + length > MAX_ADU_LEN {
                return Err(anyhow!("client {peer} sent bad MBAP length {length}"));
            }
            let total = MBAP_HEADER_LEN - 1 + length;
            stream
                .read_exact(&mut adu[MBAP_HEADER_LEN..total])
                .await
                .with_context(|| format!("client {peer} sent a truncated request"))?;

            match self.process_request(&adu[..total]) {
                Ok(Some(response)) => stream.write_all(&response).await?,
                Ok(None) => {}
                Err(err) => log::warn!("client {peer}: {err}"),
            }
        }
    }
}

/// Running Modbus/TCP server task.
pub struct MirrorServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MirrorServer {
    /// Bind `listen` and serve `mirror` until stopped.
    pub async fn start(mirror: Arc<ModbusMirror>, listen: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind Modbus/TCP server on {listen}"))?;
        let local_addr = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(mirror, listener));
        log::info!("MODBUS service is started on {local_addr}");
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop every open client connection.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
        log::info!("MODBUS service is stopped");
    }
}

async fn accept_loop(mirror: Arc<ModbusMirror>, listener: TcpListener) {
    let mut connections = JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("Modbus/TCP client {peer} connected");
                let mirror = Arc::clone(&mirror);
                connections.spawn(async move {
                    if let Err(err) = mirror.serve_connection(stream, peer).await {
                        log::warn!("{err:#}");
                    }
                });
            }
            Err(err) => log::warn!("Modbus/TCP accept failed: {err}"),
        }
        while connections.try_join_next().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_holdings_adu(unit: u8, reg: u16, count: u16) -> Vec<u8> {
        let mut adu = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, unit, 0x03];
        adu.extend_from_slice(&reg.to_be_bytes());
        adu.extend_from_slice(&count.to_be_bytes());
        adu
    }

    #[test]
    fn test_set_and_get_values() {
        let mirror = ModbusMirror::new(1, 16);
        mirror.set_values(2, &[7, 8, 9]).unwrap();
        assert_eq!(mirror.get_values(0, 6).unwrap(), vec![0, 0, 7, 8, 9, 0]);
        assert!(mirror.set_values(15, &[1, 2]).is_err());
        assert!(mirror.get_values(10, 7).is_err());
    }

    #[test]
    fn test_table_beyond_a_thousand_words() {
        let mirror = ModbusMirror::new(1, 1006);
        mirror.set_values(1000, &[3, 4]).unwrap();
        let response = mirror
            .process_request(&read_holdings_adu(1, 1000, 2))
            .unwrap()
            .unwrap();
        assert_eq!(&response[7..], &[0x03, 4, 0x00, 0x03, 0x00, 0x04]);

        let top = ModbusMirror::new(1, u16::MAX);
        top.set_values(u16::MAX - 1, &[9]).unwrap();
        assert_eq!(top.get_values(u16::MAX - 1, 1).unwrap(), vec![9]);
    }

    #[test]
    fn test_read_holdings_request() {
        let mirror = ModbusMirror::new(1, 8);
        mirror.set_values(0, &[0x0000, 0x0005]).unwrap();

        let response = mirror
            .process_request(&read_holdings_adu(1, 0, 2))
            .unwrap()
            .unwrap();
        // MBAP(7) + func + byte count + 2 registers
        assert_eq!(response.len(), 13);
        assert_eq!(&response[..2], &[0x00, 0x01]);
        assert_eq!(response[7], 0x03);
        assert_eq!(&response[8..], &[4, 0x00, 0x00, 0x00, 0x05]);
    }

    #[test]
    fn test_out_of_table_read_is_exception() {
        let mirror = ModbusMirror::new(1, 8);
        let response = mirror
            .process_request(&read_holdings_adu(1, 6, 4))
            .unwrap()
            .unwrap();
        assert_eq!(response[7], 0x83);
        assert_eq!(response[8], 0x02);
    }

    #[test]
    fn test_writes_are_rejected() {
        let mirror = ModbusMirror::new(1, 8);
        // write single register 0 := 0x1234
        let request = [0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x00, 0x12, 0x34];
        let response = mirror.process_request(&request).unwrap().unwrap();
        assert_eq!(response[7], 0x86);
        assert_eq!(response[8], 0x01);
        assert_eq!(mirror.get_values(0, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_other_unit_is_ignored() {
        let mirror = ModbusMirror::new(1, 8);
        assert!(mirror
            .process_request(&read_holdings_adu(9, 0, 1))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let mirror = ModbusMirror::new(1, 8);
        mirror.set_values(4, &[42]).unwrap();
        let server = MirrorServer::start(Arc::clone(&mirror), "127.0.0.1:0")
            .await
            .unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client
            .write_all(&read_holdings_adu(1, 4, 1))
            .await
            .unwrap();
        let mut response = [0u8; 11];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response[7..], &[0x03, 2, 0x00, 42]);

        server.stop().await;
    }
}
