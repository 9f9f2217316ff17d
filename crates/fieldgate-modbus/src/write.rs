//! Register write path.
//!
//! Used by the MQTT subscribe-to-write bridge. Function code selection
//! follows the register definition: coils get FC 05/15, holding registers
//! FC 06 for single-word values and FC 16 for multi-word values. Input
//! registers and discrete inputs are read-only.

use fieldgate_core::{FunctionCode, RegisterConfig};

use crate::codec;
use crate::error::{ModbusError, Result};
use crate::io::RegisterIo;

/// Write a calibrated value to one register. The inverse calibration is
/// applied first (raw = (value - offset) / scale), then the raw value is
/// encoded into wire words. Returns the words actually written.
pub async fn write_value(
    io: &mut dyn RegisterIo,
    register: &RegisterConfig,
    value: f64,
) -> Result<Vec<u16>> {
    let raw = if register.scale != 0.0 {
        (value - register.offset) / register.scale
    } else {
        return Err(ModbusError::Config(format!(
            "register '{}' has zero scale",
            register.register_id
        )));
    };

    match register.function_code {
        FunctionCode::ReadCoils => {
            let bit = raw != 0.0;
            io.write_coil(register.address, bit).await?;
            Ok(vec![u16::from(bit)])
        }
        FunctionCode::ReadHoldingRegisters => {
            let words = codec::encode(register.data_type, raw)?;
            if words.len() == 1 {
                io.write_register(register.address, words[0]).await?;
            } else {
                io.write_registers(register.address, &words).await?;
            }
            Ok(words)
        }
        FunctionCode::ReadDiscreteInputs | FunctionCode::ReadInputRegisters => {
            Err(ModbusError::Write(format!(
                "register '{}' is read-only (FC {})",
                register.register_id,
                register.function_code.code()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::mock::MockIo;
    use fieldgate_core::DataType;

    fn register(fc: FunctionCode, data_type: DataType, scale: f64) -> RegisterConfig {
        RegisterConfig {
            register_id: "r1".to_string(),
            name: "r1".to_string(),
            description: String::new(),
            unit: String::new(),
            address: 40,
            function_code: fc,
            data_type,
            scale,
            offset: 0.0,
        }
    }

    #[tokio::test]
    async fn test_single_word_uses_fc06() {
        let mut io = MockIo::default();
        let reg = register(FunctionCode::ReadHoldingRegisters, DataType::Uint16, 1.0);
        let words = write_value(&mut io, &reg, 255.0).await.unwrap();
        assert_eq!(words, vec![255]);
        assert_eq!(io.written, vec![(40, vec![255])]);
    }

    #[tokio::test]
    async fn test_multi_word_uses_fc16() {
        let mut io = MockIo::default();
        let reg = register(FunctionCode::ReadHoldingRegisters, DataType::Float32Be, 1.0);
        let words = write_value(&mut io, &reg, 25.5).await.unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(io.written.len(), 1);
        assert_eq!(io.written[0].0, 40);
        assert_eq!(io.written[0].1, words);
    }

    #[tokio::test]
    async fn test_coil_write_uses_fc05() {
        let mut io = MockIo::default();
        let reg = register(FunctionCode::ReadCoils, DataType::Bool, 1.0);
        let words = write_value(&mut io, &reg, 1.0).await.unwrap();
        assert_eq!(words, vec![1]);
        assert_eq!(io.coils_written, vec![(40, vec![true])]);
    }

    #[tokio::test]
    async fn test_inverse_calibration_applied() {
        // scale 0.01: writing 25.5 must put raw 2550 on the wire.
        let mut io = MockIo::default();
        let reg = register(FunctionCode::ReadHoldingRegisters, DataType::Uint16, 0.01);
        let words = write_value(&mut io, &reg, 25.5).await.unwrap();
        assert_eq!(words, vec![2550]);
    }

    #[tokio::test]
    async fn test_input_register_rejected() {
        let mut io = MockIo::default();
        let reg = register(FunctionCode::ReadInputRegisters, DataType::Uint16, 1.0);
        assert!(write_value(&mut io, &reg, 1.0).await.is_err());
    }
}
