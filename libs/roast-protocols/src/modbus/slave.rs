//! In-memory Modbus slave
//!
//! Answers RTU, ASCII, Binary and TCP request frames from four register
//! tables. Clones share the same tables.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::pdu::{ModbusOp, ModbusRequest, ModbusResponse};
use super::{ascii, binary, rtu, tcp};

/// Exception code: illegal data address
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

#[derive(Debug, Default)]
struct Tables {
    coils: BTreeMap<u16, bool>,
    discrete_inputs: BTreeMap<u16, bool>,
    input_registers: BTreeMap<u16, u16>,
    holding_registers: BTreeMap<u16, u16>,
    /// Every request answered, in arrival order
    log: Vec<ModbusRequest>,
}

#[derive(Debug, Clone)]
pub struct ModbusSlave {
    unit: u8,
    tables: Arc<Mutex<Tables>>,
}

impl ModbusSlave {
    pub fn new(unit: u8) -> Self {
        Self {
            unit,
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        self.tables.lock().holding_registers.insert(address, value);
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        self.tables.lock().holding_registers.get(&address).copied()
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.tables.lock().input_registers.insert(address, value);
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.tables.lock().coils.insert(address, value);
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.tables.lock().coils.get(&address).copied()
    }

    pub fn set_discrete(&self, address: u16, value: bool) {
        self.tables.lock().discrete_inputs.insert(address, value);
    }

    /// Requests answered so far
    pub fn requests(&self) -> Vec<ModbusRequest> {
        self.tables.lock().log.clone()
    }

    /// Apply one request to the tables
    ///
    /// Returns the exception code when any addressed point does not exist.
    pub fn execute(&self, op: &ModbusOp) -> Result<ModbusResponse, u8> {
        let mut tables = self.tables.lock();

        fn span(address: u16, count: u16) -> Result<Vec<u16>, u8> {
            (0..count)
                .map(|i| address.checked_add(i).ok_or(ILLEGAL_DATA_ADDRESS))
                .collect()
        }
        fn read<T: Copy>(table: &BTreeMap<u16, T>, address: u16, count: u16) -> Result<Vec<T>, u8> {
            span(address, count)?
                .into_iter()
                .map(|a| table.get(&a).copied().ok_or(ILLEGAL_DATA_ADDRESS))
                .collect()
        }
        fn write<T>(table: &mut BTreeMap<u16, T>, address: u16, values: Vec<T>) -> Result<(), u8> {
            let addresses = span(address, values.len() as u16)?;
            if addresses.iter().any(|a| !table.contains_key(a)) {
                return Err(ILLEGAL_DATA_ADDRESS);
            }
            table.extend(addresses.into_iter().zip(values));
            Ok(())
        }

        match op {
            ModbusOp::ReadCoils { address, count } => {
                read(&tables.coils, *address, *count).map(ModbusResponse::Bits)
            },
            ModbusOp::ReadDiscreteInputs { address, count } => {
                read(&tables.discrete_inputs, *address, *count).map(ModbusResponse::Bits)
            },
            ModbusOp::ReadHoldingRegisters { address, count } => {
                read(&tables.holding_registers, *address, *count).map(ModbusResponse::Registers)
            },
            ModbusOp::ReadInputRegisters { address, count } => {
                read(&tables.input_registers, *address, *count).map(ModbusResponse::Registers)
            },
            ModbusOp::WriteSingleCoil { address, value } => {
                write(&mut tables.coils, *address, vec![*value])?;
                Ok(ModbusResponse::WriteSingle {
                    address: *address,
                    value: if *value { 0xFF00 } else { 0x0000 },
                })
            },
            ModbusOp::WriteSingleRegister { address, value } => {
                write(&mut tables.holding_registers, *address, vec![*value])?;
                Ok(ModbusResponse::WriteSingle {
                    address: *address,
                    value: *value,
                })
            },
            ModbusOp::WriteMultipleCoils { address, values } => {
                write(&mut tables.coils, *address, values.clone())?;
                Ok(ModbusResponse::WriteMultiple {
                    address: *address,
                    quantity: values.len() as u16,
                })
            },
            ModbusOp::WriteMultipleRegisters { address, values } => {
                write(&mut tables.holding_registers, *address, values.clone())?;
                Ok(ModbusResponse::WriteMultiple {
                    address: *address,
                    quantity: values.len() as u16,
                })
            },
            ModbusOp::MaskWriteRegister {
                address,
                and_mask,
                or_mask,
            } => {
                let current = *tables
                    .holding_registers
                    .get(address)
                    .ok_or(ILLEGAL_DATA_ADDRESS)?;
                let updated = (current & and_mask) | (or_mask & !and_mask);
                tables.holding_registers.insert(*address, updated);
                Ok(ModbusResponse::MaskWrite {
                    address: *address,
                    and_mask: *and_mask,
                    or_mask: *or_mask,
                })
            },
        }
    }

    /// Run `request` if it is addressed to this unit
    fn answer(&self, request: &ModbusRequest) -> Option<Result<ModbusResponse, u8>> {
        if request.slave != self.unit {
            debug!("Slave {} ignoring request for unit {}", self.unit, request.slave);
            return None;
        }
        let result = self.execute(&request.op);
        self.tables.lock().log.push(request.clone());
        Some(result)
    }

    /// Reply to an RTU request frame; `None` means stay silent
    pub fn respond_rtu(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let request = rtu::decode_request(frame)
            .map_err(|e| debug!("Slave dropped RTU frame: {}", e))
            .ok()?;
        let function = request.function_code();
        Some(match self.answer(&request)? {
            Ok(response) => rtu::encode_response(self.unit, function, &response),
            Err(code) => rtu::encode_exception(self.unit, function, code),
        })
    }

    pub fn respond_ascii(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let request = ascii::decode_request(frame)
            .map_err(|e| debug!("Slave dropped ASCII frame: {}", e))
            .ok()?;
        let function = request.function_code();
        Some(match self.answer(&request)? {
            Ok(response) => ascii::encode_response(self.unit, function, &response),
            Err(code) => ascii::encode_exception(self.unit, function, code),
        })
    }

    pub fn respond_binary(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let request = binary::decode_request(frame)
            .map_err(|e| debug!("Slave dropped binary frame: {}", e))
            .ok()?;
        let function = request.function_code();
        Some(match self.answer(&request)? {
            Ok(response) => binary::encode_response(self.unit, function, &response),
            Err(code) => binary::encode_exception(self.unit, function, code),
        })
    }

    /// Reply to an MBAP framed request (TCP and UDP)
    pub fn respond_tcp(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let (transaction, request) = tcp::decode_request(frame)
            .map_err(|e| debug!("Slave dropped MBAP frame: {}", e))
            .ok()?;
        let function = request.function_code();
        Some(match self.answer(&request)? {
            Ok(response) => tcp::encode_response(transaction, self.unit, function, &response),
            Err(code) => tcp::encode_exception(transaction, self.unit, function, code),
        })
    }

    /// Serve Modbus TCP on `listener` until the task is dropped
    pub async fn serve_tcp(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Modbus slave {} listening on {}", self.unit, addr);
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let slave = self.clone();
                    tokio::spawn(async move { slave.handle_connection(stream, peer).await });
                },
                Err(e) => {
                    warn!("Modbus slave accept error: {}", e);
                    break;
                },
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        debug!("Modbus slave connection from {}", peer);
        let mut pending = Vec::with_capacity(260);
        let mut buffer = [0u8; 260];
        loop {
            let n = match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buffer[..n]);

            while let crate::codec::FrameStatus::Complete(len) = tcp::frame_status(&pending) {
                let frame: Vec<u8> = pending.drain(..len).collect();
                if let Some(reply) = self.respond_tcp(&frame) {
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        }
        debug!("Modbus slave connection from {} closed", peer);
    }
}
