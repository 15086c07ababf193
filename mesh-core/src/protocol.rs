//! Host link command space: host-to-modem requests and modem-to-host responses.

/// Host request, first byte of a frame from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostCommand {
    /// Raw mesh packet to put on air (and, modem to host, a packet heard on air).
    Data = 0x00,
    GetIdentity = 0x01,
    Sign = 0x04,
    Encrypt = 0x05,
    Decrypt = 0x06,
    KeyExchange = 0x07,
    Hash = 0x08,
}

/// Modem response, first byte of a frame to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModemResponse {
    Identity = 0x11,
    Signature = 0x14,
    Encrypted = 0x15,
    Decrypted = 0x16,
    SharedSecret = 0x17,
    Hash = 0x18,
}

impl TryFrom<u8> for HostCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Data,
            0x01 => Self::GetIdentity,
            0x04 => Self::Sign,
            0x05 => Self::Encrypt,
            0x06 => Self::Decrypt,
            0x07 => Self::KeyExchange,
            0x08 => Self::Hash,
            other => return Err(other),
        })
    }
}

impl TryFrom<u8> for ModemResponse {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x11 => Self::Identity,
            0x14 => Self::Signature,
            0x15 => Self::Encrypted,
            0x16 => Self::Decrypted,
            0x17 => Self::SharedSecret,
            0x18 => Self::Hash,
            other => return Err(other),
        })
    }
}

impl From<HostCommand> for u8 {
    fn from(c: HostCommand) -> u8 {
        c as u8
    }
}

impl From<ModemResponse> for u8 {
    fn from(r: ModemResponse) -> u8 {
        r as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_response_ranges_disjoint() {
        for b in 0..=u8::MAX {
            assert!(!(HostCommand::try_from(b).is_ok() && ModemResponse::try_from(b).is_ok()));
        }
    }

    #[test]
    fn command_bytes() {
        assert_eq!(HostCommand::try_from(0x07), Ok(HostCommand::KeyExchange));
        assert_eq!(HostCommand::try_from(0x02), Err(0x02));
        assert_eq!(u8::from(ModemResponse::Hash), 0x18);
        assert_eq!(ModemResponse::try_from(0x11), Ok(ModemResponse::Identity));
    }
}
