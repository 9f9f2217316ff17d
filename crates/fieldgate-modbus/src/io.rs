//! Transport-neutral register I/O.
//!
//! The polling pass and the write path run against this trait so they are
//! identical for RTU and TCP and can be exercised in tests with a scripted
//! implementation. The production implementation wraps a tokio-modbus
//! client context.

use async_trait::async_trait;
use fieldgate_core::FunctionCode;
use tokio_modbus::client::{Context, Reader, Writer};

use crate::error::{ModbusError, Result};

/// Bit- and word-level access to one device.
#[async_trait]
pub trait RegisterIo: Send {
    async fn read_bits(&mut self, fc: FunctionCode, address: u16, count: u16) -> Result<Vec<bool>>;
    async fn read_words(&mut self, fc: FunctionCode, address: u16, count: u16) -> Result<Vec<u16>>;
    /// FC 05.
    async fn write_coil(&mut self, address: u16, value: bool) -> Result<()>;
    /// FC 15.
    async fn write_coils(&mut self, address: u16, values: &[bool]) -> Result<()>;
    /// FC 06.
    async fn write_register(&mut self, address: u16, value: u16) -> Result<()>;
    /// FC 16.
    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<()>;
}

fn transport_err(e: impl std::fmt::Display) -> ModbusError {
    ModbusError::Read(e.to_string())
}

fn exception_err(e: impl std::fmt::Debug) -> ModbusError {
    ModbusError::Exception(format!("{:?}", e))
}

#[async_trait]
impl RegisterIo for Context {
    async fn read_bits(&mut self, fc: FunctionCode, address: u16, count: u16) -> Result<Vec<bool>> {
        match fc {
            FunctionCode::ReadCoils => self
                .read_coils(address, count)
                .await
                .map_err(transport_err)?
                .map_err(exception_err),
            FunctionCode::ReadDiscreteInputs => self
                .read_discrete_inputs(address, count)
                .await
                .map_err(transport_err)?
                .map_err(exception_err),
            other => Err(ModbusError::Config(format!(
                "function code {} does not read bits",
                other.code()
            ))),
        }
    }

    async fn read_words(&mut self, fc: FunctionCode, address: u16, count: u16) -> Result<Vec<u16>> {
        match fc {
            FunctionCode::ReadHoldingRegisters => self
                .read_holding_registers(address, count)
                .await
                .map_err(transport_err)?
                .map_err(exception_err),
            FunctionCode::ReadInputRegisters => self
                .read_input_registers(address, count)
                .await
                .map_err(transport_err)?
                .map_err(exception_err),
            other => Err(ModbusError::Config(format!(
                "function code {} does not read words",
                other.code()
            ))),
        }
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<()> {
        self.write_single_coil(address, value)
            .await
            .map_err(|e| ModbusError::Write(e.to_string()))?
            .map_err(exception_err)
    }

    async fn write_coils(&mut self, address: u16, values: &[bool]) -> Result<()> {
        self.write_multiple_coils(address, values)
            .await
            .map_err(|e| ModbusError::Write(e.to_string()))?
            .map_err(exception_err)
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.write_single_register(address, value)
            .await
            .map_err(|e| ModbusError::Write(e.to_string()))?
            .map_err(exception_err)
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<()> {
        self.write_multiple_registers(address, values)
            .await
            .map_err(|e| ModbusError::Write(e.to_string()))?
            .map_err(exception_err)
    }
}
