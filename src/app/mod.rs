//! BACnet Application Layer Module
//!
//! This module holds the application layer protocol control information (APCI)
//! that the transaction state machines operate on. Service parameters are carried
//! as opaque bytes; only the header fields that drive transactions are decoded.
//!
//! # APDU Types
//!
//! - Confirmed Request PDU
//! - Unconfirmed Request PDU
//! - SimpleACK PDU
//! - ComplexACK PDU
//! - SegmentACK PDU
//! - Error PDU
//! - Reject PDU
//! - Abort PDU
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::app::Apdu;
//!
//! // Who-Is with no range limits
//! let apdu = Apdu::UnconfirmedRequest {
//!     service_choice: 8,
//!     service_data: vec![],
//! };
//! let encoded = apdu.encode();
//! assert_eq!(encoded, vec![0x10, 0x08]);
//! ```

use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use crate::device::Segmentation;
use crate::generate_custom_enum;
use crate::network::Address;

/// Result type for application layer operations
pub type Result<T> = std::result::Result<T, ApplicationError>;

/// Errors that can occur in application layer operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplicationError {
    /// Invalid APDU format
    #[error("Invalid APDU: {0}")]
    InvalidApdu(String),
    /// Unsupported APDU type
    #[error("Unsupported APDU type: {0}")]
    UnsupportedApduType(u8),
    /// Invalid local device configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// APDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl TryFrom<u8> for ApduType {
    type Error = ApplicationError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApduType::ConfirmedRequest),
            1 => Ok(ApduType::UnconfirmedRequest),
            2 => Ok(ApduType::SimpleAck),
            3 => Ok(ApduType::ComplexAck),
            4 => Ok(ApduType::SegmentAck),
            5 => Ok(ApduType::Error),
            6 => Ok(ApduType::Reject),
            7 => Ok(ApduType::Abort),
            other => Err(ApplicationError::UnsupportedApduType(other)),
        }
    }
}

bitflags! {
    /// Flag bits in the low nibble of the first APCI octet
    ///
    /// The meaning of bit 1 depends on the PDU type: segmented-response-accepted
    /// for confirmed requests, negative-ack for segment acks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PduFlags: u8 {
        const SEGMENTED = 0x08;
        const MORE_FOLLOWS = 0x04;
        const SEGMENTED_RESPONSE_ACCEPTED = 0x02;
        const NEGATIVE_ACK = 0x02;
        const SERVER = 0x01;
    }
}

/// Application Protocol Data Unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request
    ConfirmedRequest {
        segmented: bool,
        more_follows: bool,
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Unconfirmed service request
    UnconfirmedRequest {
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Simple acknowledgment
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment
    ComplexAck {
        segmented: bool,
        more_follows: bool,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Segment acknowledgment
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        window_size: u8,
    },

    /// Error PDU, error class and code are left encoded
    Error {
        invoke_id: u8,
        service_choice: u8,
        error_data: Vec<u8>,
    },

    /// Reject PDU
    Reject { invoke_id: u8, reject_reason: u8 },

    /// Abort PDU
    Abort {
        server: bool,
        invoke_id: u8,
        abort_reason: u8,
    },
}

/// Maximum segments that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxSegments {
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    GreaterThan64 = 7,
}

impl MaxSegments {
    /// Decode the 3-bit field from a confirmed request header
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            7 => MaxSegments::GreaterThan64,
            _ => MaxSegments::Unspecified,
        }
    }

    /// Number of segments the sender will accept, `None` when there is no
    /// enforceable limit (unspecified or more than 64)
    pub fn limit(&self) -> Option<usize> {
        match self {
            MaxSegments::Unspecified | MaxSegments::GreaterThan64 => None,
            MaxSegments::Two => Some(2),
            MaxSegments::Four => Some(4),
            MaxSegments::Eight => Some(8),
            MaxSegments::Sixteen => Some(16),
            MaxSegments::ThirtyTwo => Some(32),
            MaxSegments::SixtyFour => Some(64),
        }
    }

    /// Largest code that does not advertise more than `limit` segments
    pub fn from_limit(limit: Option<usize>) -> Self {
        match limit {
            None => MaxSegments::Unspecified,
            Some(n) if n > 64 => MaxSegments::GreaterThan64,
            Some(n) if n >= 64 => MaxSegments::SixtyFour,
            Some(n) if n >= 32 => MaxSegments::ThirtyTwo,
            Some(n) if n >= 16 => MaxSegments::Sixteen,
            Some(n) if n >= 8 => MaxSegments::Eight,
            Some(n) if n >= 4 => MaxSegments::Four,
            Some(n) if n >= 2 => MaxSegments::Two,
            Some(_) => MaxSegments::Unspecified,
        }
    }
}

/// Maximum APDU size that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxApduSize {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    Up1476 = 5,
}

impl MaxApduSize {
    /// Get the actual size in bytes
    pub fn size(&self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }

    /// Decode the 4-bit field from a confirmed request header
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            1 => MaxApduSize::Up128,
            2 => MaxApduSize::Up206,
            3 => MaxApduSize::Up480,
            4 => MaxApduSize::Up1024,
            5 => MaxApduSize::Up1476,
            _ => MaxApduSize::Up50,
        }
    }

    /// Largest code not exceeding `length` octets
    pub fn from_length(length: usize) -> Self {
        match length {
            n if n >= 1476 => MaxApduSize::Up1476,
            n if n >= 1024 => MaxApduSize::Up1024,
            n if n >= 480 => MaxApduSize::Up480,
            n if n >= 206 => MaxApduSize::Up206,
            n if n >= 128 => MaxApduSize::Up128,
            _ => MaxApduSize::Up50,
        }
    }
}

generate_custom_enum! {
    /// Reasons carried in an Abort PDU
    ///
    /// `ServerTimeout` and `NoResponse` are produced locally by the transaction
    /// state machines when a timer budget runs out.
    AbortReason {
        Other = 0,
        BufferOverflow = 1,
        InvalidApduInThisState = 2,
        PreemptedByHigherPriorityTask = 3,
        SegmentationNotSupported = 4,
        SecurityError = 5,
        InsufficientSecurity = 6,
        WindowSizeOutOfRange = 7,
        ApplicationExceededReplyTime = 8,
        OutOfResources = 9,
        TsmTimeout = 10,
        ApduTooLong = 11,
        ServerTimeout = 64,
        NoResponse = 65,
    },
    u8,
    64..=255
}

impl Apdu {
    /// PDU type of this APDU
    pub fn apdu_type(&self) -> ApduType {
        match self {
            Apdu::ConfirmedRequest { .. } => ApduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest { .. } => ApduType::UnconfirmedRequest,
            Apdu::SimpleAck { .. } => ApduType::SimpleAck,
            Apdu::ComplexAck { .. } => ApduType::ComplexAck,
            Apdu::SegmentAck { .. } => ApduType::SegmentAck,
            Apdu::Error { .. } => ApduType::Error,
            Apdu::Reject { .. } => ApduType::Reject,
            Apdu::Abort { .. } => ApduType::Abort,
        }
    }

    /// Invoke ID, absent only for unconfirmed requests
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::UnconfirmedRequest { .. } => None,
            Apdu::ConfirmedRequest { invoke_id, .. }
            | Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
        }
    }

    /// Replace the invoke ID (no effect on unconfirmed requests)
    pub fn set_invoke_id(&mut self, id: u8) {
        match self {
            Apdu::UnconfirmedRequest { .. } => {}
            Apdu::ConfirmedRequest { invoke_id, .. }
            | Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => *invoke_id = id,
        }
    }

    /// True for a segment of a segmented request or complex ack
    pub fn is_segmented(&self) -> bool {
        match self {
            Apdu::ConfirmedRequest { segmented, .. } | Apdu::ComplexAck { segmented, .. } => {
                *segmented
            }
            _ => false,
        }
    }

    /// More-follows flag of a segment
    pub fn more_follows(&self) -> bool {
        match self {
            Apdu::ConfirmedRequest { more_follows, .. }
            | Apdu::ComplexAck { more_follows, .. } => *more_follows,
            _ => false,
        }
    }

    /// Sequence number of a segment or segment ack
    pub fn sequence_number(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest {
                sequence_number, ..
            }
            | Apdu::ComplexAck {
                sequence_number, ..
            } => *sequence_number,
            Apdu::SegmentAck {
                sequence_number, ..
            } => Some(*sequence_number),
            _ => None,
        }
    }

    /// Proposed window size of a segment, or actual window size of a segment ack
    pub fn window_size(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest {
                proposed_window_size,
                ..
            }
            | Apdu::ComplexAck {
                proposed_window_size,
                ..
            } => *proposed_window_size,
            Apdu::SegmentAck { window_size, .. } => Some(*window_size),
            _ => None,
        }
    }

    /// Service data carried by requests and complex acks
    pub fn service_data(&self) -> &[u8] {
        match self {
            Apdu::ConfirmedRequest { service_data, .. }
            | Apdu::UnconfirmedRequest { service_data, .. }
            | Apdu::ComplexAck { service_data, .. } => service_data,
            Apdu::Error { error_data, .. } => error_data,
            _ => &[],
        }
    }

    /// Server flag of an abort or segment ack
    pub fn is_server(&self) -> bool {
        match self {
            Apdu::SegmentAck { server, .. } | Apdu::Abort { server, .. } => *server,
            _ => false,
        }
    }

    /// Encode APDU to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        match self {
            Apdu::ConfirmedRequest {
                segmented,
                more_follows,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut flags = PduFlags::empty();
                flags.set(PduFlags::SEGMENTED, *segmented);
                flags.set(PduFlags::MORE_FOLLOWS, *more_follows);
                flags.set(
                    PduFlags::SEGMENTED_RESPONSE_ACCEPTED,
                    *segmented_response_accepted,
                );
                buffer.push(((ApduType::ConfirmedRequest as u8) << 4) | flags.bits());

                // Max segments and APDU size
                buffer.push(((*max_segments as u8) << 4) | (*max_response_size as u8));
                buffer.push(*invoke_id);

                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }

                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                buffer.push((ApduType::UnconfirmedRequest as u8) << 4);
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                buffer.push((ApduType::SimpleAck as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
            }

            Apdu::ComplexAck {
                segmented,
                more_follows,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut flags = PduFlags::empty();
                flags.set(PduFlags::SEGMENTED, *segmented);
                flags.set(PduFlags::MORE_FOLLOWS, *more_follows);
                buffer.push(((ApduType::ComplexAck as u8) << 4) | flags.bits());
                buffer.push(*invoke_id);

                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }

                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SegmentAck {
                negative,
                server,
                invoke_id,
                sequence_number,
                window_size,
            } => {
                let mut flags = PduFlags::empty();
                flags.set(PduFlags::NEGATIVE_ACK, *negative);
                flags.set(PduFlags::SERVER, *server);
                buffer.push(((ApduType::SegmentAck as u8) << 4) | flags.bits());
                buffer.push(*invoke_id);
                buffer.push(*sequence_number);
                buffer.push(*window_size);
            }

            Apdu::Error {
                invoke_id,
                service_choice,
                error_data,
            } => {
                buffer.push((ApduType::Error as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
                buffer.extend_from_slice(error_data);
            }

            Apdu::Reject {
                invoke_id,
                reject_reason,
            } => {
                buffer.push((ApduType::Reject as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*reject_reason);
            }

            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                let mut flags = PduFlags::empty();
                flags.set(PduFlags::SERVER, *server);
                buffer.push(((ApduType::Abort as u8) << 4) | flags.bits());
                buffer.push(*invoke_id);
                buffer.push(*abort_reason);
            }
        }

        buffer
    }

    /// Decode APDU from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let Some(&first) = data.first() else {
            return Err(ApplicationError::InvalidApdu("Empty APDU".to_string()));
        };

        let pdu_type = ApduType::try_from(first >> 4)?;
        let flags = PduFlags::from_bits_truncate(first & 0x0F);

        match pdu_type {
            ApduType::ConfirmedRequest => {
                let segmented = flags.contains(PduFlags::SEGMENTED);
                let header_len = if segmented { 6 } else { 4 };
                if data.len() < header_len {
                    return Err(ApplicationError::InvalidApdu(
                        "Confirmed request too short".to_string(),
                    ));
                }

                let max_info = data[1];
                let (sequence_number, proposed_window_size) = if segmented {
                    (Some(data[3]), Some(data[4]))
                } else {
                    (None, None)
                };

                Ok(Apdu::ConfirmedRequest {
                    segmented,
                    more_follows: flags.contains(PduFlags::MORE_FOLLOWS),
                    segmented_response_accepted: flags
                        .contains(PduFlags::SEGMENTED_RESPONSE_ACCEPTED),
                    max_segments: MaxSegments::from_bits(max_info >> 4),
                    max_response_size: MaxApduSize::from_bits(max_info),
                    invoke_id: data[2],
                    sequence_number,
                    proposed_window_size,
                    service_choice: data[header_len - 1],
                    service_data: data[header_len..].to_vec(),
                })
            }

            ApduType::UnconfirmedRequest => {
                if data.len() < 2 {
                    return Err(ApplicationError::InvalidApdu(
                        "Unconfirmed request too short".to_string(),
                    ));
                }

                Ok(Apdu::UnconfirmedRequest {
                    service_choice: data[1],
                    service_data: data[2..].to_vec(),
                })
            }

            ApduType::SimpleAck => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu(
                        "SimpleAck too short".to_string(),
                    ));
                }

                Ok(Apdu::SimpleAck {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }

            ApduType::ComplexAck => {
                let segmented = flags.contains(PduFlags::SEGMENTED);
                let header_len = if segmented { 5 } else { 3 };
                if data.len() < header_len {
                    return Err(ApplicationError::InvalidApdu(
                        "ComplexAck too short".to_string(),
                    ));
                }

                let (sequence_number, proposed_window_size) = if segmented {
                    (Some(data[2]), Some(data[3]))
                } else {
                    (None, None)
                };

                Ok(Apdu::ComplexAck {
                    segmented,
                    more_follows: flags.contains(PduFlags::MORE_FOLLOWS),
                    invoke_id: data[1],
                    sequence_number,
                    proposed_window_size,
                    service_choice: data[header_len - 1],
                    service_data: data[header_len..].to_vec(),
                })
            }

            ApduType::SegmentAck => {
                if data.len() < 4 {
                    return Err(ApplicationError::InvalidApdu(
                        "SegmentAck too short".to_string(),
                    ));
                }

                Ok(Apdu::SegmentAck {
                    negative: flags.contains(PduFlags::NEGATIVE_ACK),
                    server: flags.contains(PduFlags::SERVER),
                    invoke_id: data[1],
                    sequence_number: data[2],
                    window_size: data[3],
                })
            }

            ApduType::Error => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu(
                        "Error PDU too short".to_string(),
                    ));
                }

                Ok(Apdu::Error {
                    invoke_id: data[1],
                    service_choice: data[2],
                    error_data: data[3..].to_vec(),
                })
            }

            ApduType::Reject => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu(
                        "Reject PDU too short".to_string(),
                    ));
                }

                Ok(Apdu::Reject {
                    invoke_id: data[1],
                    reject_reason: data[2],
                })
            }

            ApduType::Abort => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu(
                        "Abort PDU too short".to_string(),
                    ));
                }

                Ok(Apdu::Abort {
                    server: flags.contains(PduFlags::SERVER),
                    invoke_id: data[1],
                    abort_reason: data[2],
                })
            }
        }
    }
}

/// Upward interface to the application
///
/// Both callbacks run to completion on the thread that delivered the event to
/// the access point.
pub trait Application {
    /// A request from a peer: confirmed or unconfirmed requests, and aborts of
    /// transactions this device is serving
    fn indication(&mut self, apdu: Apdu, source: &Address);

    /// The outcome of a confirmed request this device initiated
    fn confirmation(&mut self, apdu: Apdu, source: &Address);
}

/// Application layer configuration of the local device
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ApplicationConfig {
    /// Maximum APDU length
    pub max_apdu_length: u16,
    /// Segmentation support
    pub segmentation: Segmentation,
    /// Maximum segments accepted, `None` for unspecified
    pub max_segments: Option<usize>,
    /// APDU timeout (milliseconds)
    pub apdu_timeout_ms: u32,
    /// Segment timeout (milliseconds)
    pub segment_timeout_ms: u32,
    /// Time the application is given to answer a confirmed request (milliseconds)
    pub application_timeout_ms: u32,
    /// Number of APDU retries
    pub apdu_retries: u8,
    /// Window size proposed when sending segmented messages
    pub proposed_window_size: u8,
    /// Invoke ID start value
    pub invoke_id_start: u8,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            max_apdu_length: 1476,
            segmentation: Segmentation::Both,
            max_segments: Some(64),
            apdu_timeout_ms: 3000,
            segment_timeout_ms: 1500,
            application_timeout_ms: 3000,
            apdu_retries: 3,
            proposed_window_size: 16,
            invoke_id_start: 0,
        }
    }
}

impl ApplicationConfig {
    /// Check the configuration for values the state machines cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_apdu_length < 50 {
            return Err(ApplicationError::InvalidConfiguration(format!(
                "max_apdu_length {} is below the BACnet minimum of 50",
                self.max_apdu_length
            )));
        }
        if self.proposed_window_size == 0 || self.proposed_window_size > 127 {
            return Err(ApplicationError::InvalidConfiguration(format!(
                "proposed_window_size {} is outside 1..=127",
                self.proposed_window_size
            )));
        }
        if let Some(limit) = self.max_segments.filter(|&limit| limit < 2) {
            return Err(ApplicationError::InvalidConfiguration(format!(
                "max_segments {} cannot be advertised, the smallest limit is 2",
                limit
            )));
        }
        if self.apdu_timeout_ms == 0
            || self.segment_timeout_ms == 0
            || self.application_timeout_ms == 0
        {
            return Err(ApplicationError::InvalidConfiguration(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn apdu_timeout(&self) -> Duration {
        Duration::from_millis(self.apdu_timeout_ms as u64)
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_millis(self.segment_timeout_ms as u64)
    }

    pub fn application_timeout(&self) -> Duration {
        Duration::from_millis(self.application_timeout_ms as u64)
    }
}
