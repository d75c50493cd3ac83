//! USB 2.0 hub class definitions (chapter 11).

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::transfer::{ControlSetup, Recipient, Request, RequestType};

/// `bDescriptorType` of the hub class descriptor.
pub const HUB_DESCRIPTOR_TYPE: u8 = 0x29;

/// Bytes up to and including `bHubContrCurrent`.
pub const HUB_DESCRIPTOR_HEADER_LEN: usize = 7;

/// Length of a GET_STATUS response: status word followed by change word.
pub const STATUS_LEN: usize = 4;

/// Hub class requests.
///
/// See USB 2.0 table 11-15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubRequest {
    GetHubDescriptor,
    GetHubStatus,
    ClearHubFeature,
    GetPortStatus,
    SetPortFeature,
    ClearPortFeature,
}

impl HubRequest {
    /// Builds the SETUP stage; `value` is the feature selector or descriptor
    /// selector, `port` is ignored for hub-level requests.
    pub fn setup(self, value: u16, port: u8) -> ControlSetup {
        let (request, recipient, value, index) = match self {
            HubRequest::GetHubDescriptor => (
                Request::GetDescriptor,
                Recipient::Device,
                (HUB_DESCRIPTOR_TYPE as u16) << 8,
                0,
            ),
            HubRequest::GetHubStatus => (Request::GetStatus, Recipient::Device, 0, 0),
            HubRequest::ClearHubFeature => (Request::ClearFeature, Recipient::Device, value, 0),
            HubRequest::GetPortStatus => (Request::GetStatus, Recipient::Other, 0, port as u16),
            HubRequest::SetPortFeature => {
                (Request::SetFeature, Recipient::Other, value, port as u16)
            }
            HubRequest::ClearPortFeature => {
                (Request::ClearFeature, Recipient::Other, value, port as u16)
            }
        };
        ControlSetup {
            request_type: RequestType::Class,
            recipient,
            request,
            value,
            index,
        }
    }
}

/// Port feature selectors (USB 2.0 table 11-17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum PortFeature {
    Connection = 0,
    Enable = 1,
    Suspend = 2,
    OverCurrent = 3,
    Reset = 4,
    Power = 8,
    LowSpeed = 9,
    HighSpeed = 10,
    CConnection = 0x10,
    CEnable = 0x11,
    CSuspend = 0x12,
    COverCurrent = 0x13,
    CReset = 0x14,
}

/// Hub feature selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum HubFeature {
    CHubLocalPower = 0,
    CHubOverCurrent = 1,
}

bitflags::bitflags! {
    /// `wPortStatus` (USB 2.0 table 11-21).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortStatus: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        const TEST = 1 << 11;
        const INDICATOR = 1 << 12;
    }

    /// `wPortChange` (USB 2.0 table 11-22).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortChange: u16 {
        const C_CONNECTION = 1 << 0;
        const C_ENABLE = 1 << 1;
        const C_SUSPEND = 1 << 2;
        const C_OVER_CURRENT = 1 << 3;
        const C_RESET = 1 << 4;
    }

    /// `wHubStatus` (USB 2.0 table 11-19).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HubStatus: u16 {
        const LOCAL_POWER = 1 << 0;
        const OVER_CURRENT = 1 << 1;
    }

    /// `wHubChange` (USB 2.0 table 11-20).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HubChange: u16 {
        const C_LOCAL_POWER = 1 << 0;
        const C_OVER_CURRENT = 1 << 1;
    }
}

impl PortStatus {
    /// Splits a GET_STATUS(port) response into status and change words.
    pub fn decode(raw: [u8; STATUS_LEN]) -> (PortStatus, PortChange) {
        let status = u16::from_le_bytes([raw[0], raw[1]]);
        let change = u16::from_le_bytes([raw[2], raw[3]]);
        (
            PortStatus::from_bits_retain(status),
            PortChange::from_bits_retain(change),
        )
    }

    /// Speed of the attached device; full speed unless a speed bit is set.
    pub fn speed(&self) -> DeviceSpeed {
        if self.contains(PortStatus::LOW_SPEED) {
            DeviceSpeed::Low
        } else if self.contains(PortStatus::HIGH_SPEED) {
            DeviceSpeed::High
        } else {
            DeviceSpeed::Full
        }
    }
}

impl PortChange {
    /// The lowest pending change bit and the feature selector that
    /// acknowledges it.
    pub fn first_pending(self) -> Option<(PortChange, PortFeature)> {
        [
            (PortChange::C_CONNECTION, PortFeature::CConnection),
            (PortChange::C_ENABLE, PortFeature::CEnable),
            (PortChange::C_SUSPEND, PortFeature::CSuspend),
            (PortChange::C_OVER_CURRENT, PortFeature::COverCurrent),
            (PortChange::C_RESET, PortFeature::CReset),
        ]
        .into_iter()
        .find(|(bit, _)| self.contains(*bit))
    }
}

impl HubStatus {
    /// Splits a GET_STATUS(hub) response into status and change words.
    pub fn decode(raw: [u8; STATUS_LEN]) -> (HubStatus, HubChange) {
        let status = u16::from_le_bytes([raw[0], raw[1]]);
        let change = u16::from_le_bytes([raw[2], raw[3]]);
        (
            HubStatus::from_bits_retain(status),
            HubChange::from_bits_retain(change),
        )
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DeviceSpeed {
    Low = 0,
    #[default]
    Full = 1,
    High = 2,
    Wireless = 3,
    SuperSpeed = 4,
    SuperSpeedPlus = 5,
}

impl DeviceSpeed {
    /// Low and full speed traffic below a high speed hub goes through a
    /// transaction translator.
    pub fn needs_tt(&self) -> bool {
        matches!(self, DeviceSpeed::Low | DeviceSpeed::Full)
    }
}

impl From<u8> for DeviceSpeed {
    fn from(value: u8) -> Self {
        match value {
            0 => DeviceSpeed::Low,
            1 => DeviceSpeed::Full,
            2 => DeviceSpeed::High,
            3 => DeviceSpeed::Wireless,
            4 => DeviceSpeed::SuperSpeed,
            5 => DeviceSpeed::SuperSpeedPlus,
            _ => DeviceSpeed::Full,
        }
    }
}

/// Parsed hub class descriptor.
///
/// See USB 2.0 section 11.23.2.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubDescriptor {
    pub length: u8,

    /// `bNbrPorts`
    pub num_ports: u8,

    pub characteristics: HubCharacteristics,

    /// Power-on to power-good time, in 2 ms units.
    pub power_good_time: u8,

    /// Hub controller current, in mA.
    pub hub_current: u8,

    /// `DeviceRemovable`; bit n set means the device on port n is fixed.
    pub non_removable: u8,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("hub descriptor too short: {0} bytes")]
    TooShort(usize),
    #[error("unexpected descriptor type {0:#04x}")]
    BadType(u8),
}

impl HubDescriptor {
    /// Full descriptor length for `num_ports`: header, removable bitmap and
    /// the legacy power control mask byte.
    pub fn full_len(num_ports: u8) -> usize {
        HUB_DESCRIPTOR_HEADER_LEN + (num_ports as usize).div_ceil(8) + 1
    }

    /// Reads `bNbrPorts` out of the first bytes of the descriptor.
    pub fn peek_num_ports(raw: &[u8]) -> Result<u8, DescriptorError> {
        Self::check_header(raw)?;
        Ok(raw[2])
    }

    /// Parses a descriptor; a header-only read leaves `non_removable` zero.
    pub fn parse(raw: &[u8]) -> Result<Self, DescriptorError> {
        Self::check_header(raw)?;
        let characteristics = u16::from_le_bytes([raw[3], raw[4]]);
        Ok(Self {
            length: raw[0],
            num_ports: raw[2],
            characteristics: HubCharacteristics::from_descriptor(characteristics),
            power_good_time: raw[5],
            hub_current: raw[6],
            non_removable: raw.get(HUB_DESCRIPTOR_HEADER_LEN).copied().unwrap_or(0),
        })
    }

    fn check_header(raw: &[u8]) -> Result<(), DescriptorError> {
        if raw.len() < HUB_DESCRIPTOR_HEADER_LEN {
            return Err(DescriptorError::TooShort(raw.len()));
        }
        if raw[1] != HUB_DESCRIPTOR_TYPE {
            return Err(DescriptorError::BadType(raw[1]));
        }
        Ok(())
    }
}

/// `wHubCharacteristics`
///
/// See USB 2.0 figure 11-16 / table 11-13.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubCharacteristics {
    pub power_switching: PowerSwitchingMode,

    pub compound_device: bool,

    pub over_current_mode: OverCurrentMode,

    /// TT think time, in full-speed bit times (8, 16, 24 or 32).
    pub tt_think_time: u8,

    pub port_indicators: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSwitchingMode {
    /// All ports powered at once
    Ganged,

    /// Each port powered individually
    Individual,

    /// No power switching (always powered)
    AlwaysPower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverCurrentMode {
    Global,

    Individual,
}

impl HubCharacteristics {
    pub fn from_descriptor(value: u16) -> Self {
        let power_switching = match value & 0x03 {
            0x00 => PowerSwitchingMode::Ganged,
            0x01 => PowerSwitchingMode::Individual,
            _ => PowerSwitchingMode::AlwaysPower,
        };

        let compound_device = (value & 0x04) != 0;
        let over_current_mode = if (value & 0x08) != 0 {
            OverCurrentMode::Individual
        } else {
            OverCurrentMode::Global
        };
        let tt_think_time = (((value >> 5) & 0x03) as u8 + 1) * 8;
        let port_indicators = (value & 0x80) != 0;

        Self {
            power_switching,
            compound_device,
            over_current_mode,
            tt_think_time,
            port_indicators,
        }
    }

    pub fn to_descriptor(&self) -> u16 {
        let mut value = 0u16;

        value |= match self.power_switching {
            PowerSwitchingMode::Ganged => 0x00,
            PowerSwitchingMode::Individual => 0x01,
            PowerSwitchingMode::AlwaysPower => 0x02,
        };

        if self.compound_device {
            value |= 0x04;
        }

        if matches!(self.over_current_mode, OverCurrentMode::Individual) {
            value |= 0x08;
        }

        value |= (((self.tt_think_time / 8).clamp(1, 4) - 1) as u16) << 5;

        if self.port_indicators {
            value |= 0x80;
        }

        value
    }
}
