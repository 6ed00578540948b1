use crate::error::{AttachError, Result};

/// Key under which every filter program expects its configuration.
///
/// The config regions are single-entry array maps, so the key is always
/// slot 0 with a 4-byte index.
pub const CONFIG_KEY: u32 = 0;

/// Width of a process-name value: the kernel's `task->comm` field.
pub const COMM_WIDTH: usize = 16;

/// Width of a TCP port value.
pub const PORT_WIDTH: usize = 2;

/// Runtime configuration handed to an attached filter program.
///
/// The variant must match what the compiled artifact expects: the comm-based
/// filters read a 16-byte name, the port-based filters read a 2-byte port.
/// A mismatch surfaces as [`AttachError::RegionWidthMismatch`] at write time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigValue {
    /// Allowed process name, compared against `task->comm` in the kernel.
    ProcessName(String),
    /// TCP destination port to drop.
    Port(u16),
}

impl ConfigValue {
    /// Encode into the exact byte layout the config region expects.
    ///
    /// Process names are written left-aligned and zero-padded to 16 bytes,
    /// the same layout `bpf_get_current_comm()` produces, so the in-kernel
    /// `memcmp` over the full field matches. Names longer than 16 bytes are
    /// rejected rather than truncated: a truncated name would silently match
    /// a different set of processes.
    ///
    /// Ports are big-endian, matching `tcph->dest` on the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            ConfigValue::ProcessName(name) => {
                let bytes = name.as_bytes();
                if bytes.len() > COMM_WIDTH {
                    return Err(AttachError::IdentifierTooLong {
                        len: bytes.len(),
                        max: COMM_WIDTH,
                    });
                }
                let mut buf = vec![0u8; COMM_WIDTH];
                buf[..bytes.len()].copy_from_slice(bytes);
                Ok(buf)
            }
            ConfigValue::Port(port) => Ok(port.to_be_bytes().to_vec()),
        }
    }

    /// Byte width this value occupies in its config region.
    pub fn width(&self) -> usize {
        match self {
            ConfigValue::ProcessName(_) => COMM_WIDTH,
            ConfigValue::Port(_) => PORT_WIDTH,
        }
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::ProcessName(name) => write!(f, "process '{name}'"),
            ConfigValue::Port(port) => write!(f, "port {port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_name_is_zero_padded() {
        let encoded = ConfigValue::ProcessName("nc".to_string()).encode().unwrap();
        assert_eq!(encoded.len(), COMM_WIDTH);
        assert_eq!(&encoded[..2], b"nc");
        assert!(encoded[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn process_name_of_exactly_sixteen_bytes_fits() {
        let name = "a".repeat(16);
        let encoded = ConfigValue::ProcessName(name.clone()).encode().unwrap();
        assert_eq!(encoded, name.as_bytes());
    }

    #[test]
    fn over_long_process_name_is_rejected_not_truncated() {
        let err = ConfigValue::ProcessName("this-name-is-way-too-long-for-the-field".to_string())
            .encode()
            .unwrap_err();
        match err {
            AttachError::IdentifierTooLong { len, max } => {
                assert_eq!(len, 39);
                assert_eq!(max, COMM_WIDTH);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn port_encodes_big_endian() {
        assert_eq!(ConfigValue::Port(4040).encode().unwrap(), vec![0x0f, 0xc8]);
        assert_eq!(ConfigValue::Port(0).encode().unwrap(), vec![0, 0]);
        assert_eq!(
            ConfigValue::Port(u16::MAX).encode().unwrap(),
            vec![0xff, 0xff]
        );
    }

    #[test]
    fn port_round_trips_for_boundary_values() {
        for port in [0u16, 1, 80, 4040, 8080, u16::MAX - 1, u16::MAX] {
            let encoded = ConfigValue::Port(port).encode().unwrap();
            assert_eq!(u16::from_be_bytes([encoded[0], encoded[1]]), port);
        }
    }
}
