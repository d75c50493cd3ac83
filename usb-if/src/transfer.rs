use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Standard request codes (USB 2.0 table 9-4) used by the hub class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Request {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetConfiguration = 0x09,
    SetInterface = 0x0b,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: Request,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// `bmRequestType` as it goes on the wire.
    pub fn bm_request_type(&self, direction: Direction) -> u8 {
        let dir = match direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        dir | (u8::from(self.request_type) << 5) | u8::from(self.recipient)
    }

    /// Encodes the 8-byte SETUP packet.
    pub fn to_bytes(&self, direction: Direction, length: u16) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = length.to_le_bytes();
        [
            self.bm_request_type(direction),
            self.request.into(),
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}
