//! BACnet Transaction State Machines
//!
//! Confirmed services are carried out as transactions identified by an invoke
//! ID. Each transaction is driven by a segmentation state machine (SSM): a
//! [`ClientSsm`] for requests this device initiated, a [`ServerSsm`] for
//! requests received from peers. The [`StateMachineAccessPoint`] owns both
//! registries, creates the machines and routes every event to the right one.
//!
//! # Segmentation
//!
//! A message larger than the smaller of the two devices' maximum APDU lengths
//! is split into segments. The sender transmits up to `actual_window_size`
//! segments, then waits for a SegmentACK carrying the last sequence number
//! received and the window the receiver accepts. Sequence numbers run modulo
//! 256. Lost segments are detected by the receiver (out-of-order sequence
//! numbers are answered with a negative ack) and lost acks by the sender's
//! segment timer.
//!
//! # Events
//!
//! All processing is synchronous. An event (a PDU from the network, a call
//! from the application or an expired timer) runs to completion before the
//! next one is looked at, and a transaction that reaches `Completed` or
//! `Aborted` is removed from its registry before the call returns.

mod access_point;
mod client;
mod server;

use std::fmt;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

use crate::app::{AbortReason, Apdu, ApduType, Application, ApplicationConfig, ApplicationError};
use crate::device::{DeviceDirectory, DeviceInfo};
use crate::network::Address;
use crate::timer::{Scheduler, TimerHandle};
use crate::transport::Transport;

pub use access_point::StateMachineAccessPoint;
pub use client::ClientSsm;
pub use server::ServerSsm;

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Caller errors raised by the transaction layer
///
/// Misbehaving peers never produce these; they are answered with Abort PDUs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: TransactionState,
        to: TransactionState,
    },
    #[error("no segmentation context established")]
    NoSegmentationContext,
    #[error("invalid segment index {index}, segment count is {count}")]
    InvalidSegmentIndex { index: usize, count: usize },
    #[error("invoke ID {0} is already in use")]
    InvokeIdInUse(u8),
    #[error("no invoke ID available")]
    NoAvailableInvokeId,
    #[error("expected a confirmed request, got {0:?}")]
    NotAConfirmedRequest(ApduType),
    #[error("{kind:?} is not valid in state {state:?}")]
    UnexpectedApdu {
        kind: ApduType,
        state: TransactionState,
    },
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

/// Transaction states shared by client and server machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Idle,
    SegmentedRequest,
    AwaitConfirmation,
    AwaitResponse,
    SegmentedResponse,
    SegmentedConfirmation,
    Completed,
    Aborted,
}

impl TransactionState {
    /// `Completed` and `Aborted` admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Aborted)
    }

    /// States that move segments in either direction
    pub fn is_segmented(&self) -> bool {
        matches!(
            self,
            TransactionState::SegmentedRequest
                | TransactionState::SegmentedResponse
                | TransactionState::SegmentedConfirmation
        )
    }
}

/// Registry key of a transaction, also carried by its timers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionKey {
    /// Locally initiated, invoke IDs are allocated by this device
    Client(u8),
    /// Remotely initiated, invoke IDs are only unique per requesting device
    Server(Address, u8),
}

/// Which end of the transaction a machine drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Collaborators a state machine may touch while handling one event
pub(crate) struct Context<'a> {
    pub transport: &'a mut dyn Transport,
    pub application: &'a mut dyn Application,
    pub scheduler: &'a mut dyn Scheduler,
    pub directory: &'a dyn DeviceDirectory,
    pub config: &'a ApplicationConfig,
}

/// Outcome of feeding one segment to a reassembly context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentReceived {
    /// Sequence gap, a negative ack was sent
    OutOfOrder,
    /// Appended, more segments expected in this window
    InWindow,
    /// Appended and the window was acknowledged
    WindowAcked,
    /// The final segment arrived and was acknowledged
    Complete,
}

/// Outcome of a segment ack for the sending side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckReceived {
    /// Duplicate or late ack
    Ignored,
    /// The next window went out
    WindowSent,
    /// Every segment has been acknowledged
    AllAcked,
}

/// Number of segments needed for `length` octets; never zero
pub(crate) fn segment_count_for(length: usize, segment_size: usize) -> usize {
    if segment_size == 0 {
        return 1;
    }
    length.div_ceil(segment_size).max(1)
}

/// Clamp a window to `1..=limit`, windows above 127 are not encodable
pub(crate) fn clamp_window(window: u8, limit: Option<usize>) -> u8 {
    let limit = limit.unwrap_or(127).clamp(1, 127) as u8;
    window.clamp(1, limit)
}

/// State and segmentation context common to client and server machines
#[derive(Debug)]
pub struct Ssm {
    role: Role,
    address: Address,
    invoke_id: u8,
    state: TransactionState,
    remote_device: Option<DeviceInfo>,
    segment_apdu: Option<Apdu>,
    segment_size: usize,
    segment_count: usize,
    max_segments_accepted: Option<usize>,
    retry_count: u8,
    segment_retry_count: u8,
    sent_all_segments: bool,
    last_sequence_number: u8,
    initial_sequence_number: u8,
    // segment index that initial_sequence_number refers to
    window_start: usize,
    actual_window_size: u8,
    proposed_window_size: u8,
    timer: Option<TimerHandle>,
}

impl Ssm {
    pub(crate) fn new(role: Role, address: Address, invoke_id: u8) -> Self {
        Self {
            role,
            address,
            invoke_id,
            state: TransactionState::Idle,
            remote_device: None,
            segment_apdu: None,
            segment_size: 0,
            segment_count: 0,
            max_segments_accepted: None,
            retry_count: 0,
            segment_retry_count: 0,
            sent_all_segments: false,
            last_sequence_number: 0,
            initial_sequence_number: 0,
            window_start: 0,
            actual_window_size: 1,
            proposed_window_size: 1,
            timer: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn invoke_id(&self) -> u8 {
        self.invoke_id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn remote_device(&self) -> Option<&DeviceInfo> {
        self.remote_device.as_ref()
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// Window resends since the last segment ack
    pub fn segment_retry_count(&self) -> u8 {
        self.segment_retry_count
    }

    pub fn sent_all_segments(&self) -> bool {
        self.sent_all_segments
    }

    pub fn last_sequence_number(&self) -> u8 {
        self.last_sequence_number
    }

    pub fn actual_window_size(&self) -> u8 {
        self.actual_window_size
    }

    pub fn proposed_window_size(&self) -> u8 {
        self.proposed_window_size
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub(crate) fn key(&self) -> TransactionKey {
        match self.role {
            Role::Client => TransactionKey::Client(self.invoke_id),
            Role::Server => TransactionKey::Server(self.address.clone(), self.invoke_id),
        }
    }

    /// Move to `new_state`, replacing any running timer with one of
    /// `timeout` (no timer for `None`)
    pub(crate) fn set_state(
        &mut self,
        ctx: &mut Context<'_>,
        new_state: TransactionState,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.state.is_terminal() {
            return Err(TransactionError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        debug!(
            "{} {} at {}: {:?} -> {:?}",
            self.role, self.invoke_id, self.address, self.state, new_state
        );
        self.stop_timer(ctx);
        self.state = new_state;
        if let Some(timeout) = timeout {
            self.start_timer(ctx, timeout);
        }
        Ok(())
    }

    pub(crate) fn start_timer(&mut self, ctx: &mut Context<'_>, timeout: Duration) {
        self.stop_timer(ctx);
        self.timer = Some(ctx.scheduler.schedule(timeout, self.key()));
    }

    pub(crate) fn start_segment_timer(&mut self, ctx: &mut Context<'_>) {
        let timeout = ctx.config.segment_timeout();
        self.start_timer(ctx, timeout);
    }

    pub(crate) fn stop_timer(&mut self, ctx: &mut Context<'_>) {
        if let Some(handle) = self.timer.take() {
            ctx.scheduler.cancel(handle);
        }
    }

    /// Claim an expired timer; false when `handle` is not the one outstanding
    pub(crate) fn take_expired_timer(&mut self, handle: TimerHandle) -> bool {
        if self.timer == Some(handle) {
            self.timer = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn send(&self, ctx: &mut Context<'_>, apdu: &Apdu) {
        ctx.transport.send(apdu, &self.address);
    }

    /// Hand `apdu` to the application in the direction this role reports in
    pub(crate) fn deliver(&self, ctx: &mut Context<'_>, apdu: Apdu) {
        match self.role {
            Role::Client => ctx.application.confirmation(apdu, &self.address),
            Role::Server => ctx.application.indication(apdu, &self.address),
        }
    }

    /// Enter `Aborted` and build the Abort PDU announcing it
    pub(crate) fn abort(&mut self, ctx: &mut Context<'_>, reason: AbortReason) -> Result<Apdu> {
        warn!(
            "{} {} at {}: aborting in {:?}, {}",
            self.role, self.invoke_id, self.address, self.state, reason
        );
        self.set_state(ctx, TransactionState::Aborted, None)?;
        Ok(Apdu::Abort {
            server: self.role == Role::Server,
            invoke_id: self.invoke_id,
            abort_reason: reason.into(),
        })
    }

    /// Abort and tell the peer only
    pub(crate) fn abort_peer(&mut self, ctx: &mut Context<'_>, reason: AbortReason) -> Result<()> {
        let abort = self.abort(ctx, reason)?;
        self.send(ctx, &abort);
        Ok(())
    }

    /// Abort and tell the application only
    pub(crate) fn abort_local(&mut self, ctx: &mut Context<'_>, reason: AbortReason) -> Result<()> {
        let abort = self.abort(ctx, reason)?;
        self.deliver(ctx, abort);
        Ok(())
    }

    /// Abort and tell both the peer and the application
    pub(crate) fn abort_both(&mut self, ctx: &mut Context<'_>, reason: AbortReason) -> Result<()> {
        let abort = self.abort(ctx, reason)?;
        self.send(ctx, &abort);
        self.deliver(ctx, abort);
        Ok(())
    }

    /// Prepare to send `apdu`, split into `segment_size` octet segments
    pub(crate) fn load_outgoing(&mut self, apdu: Apdu, segment_size: usize) {
        self.segment_size = segment_size;
        self.segment_count = segment_count_for(apdu.service_data().len(), segment_size);
        self.segment_apdu = Some(apdu);
        self.sent_all_segments = false;
        self.segment_retry_count = 0;
        self.initial_sequence_number = 0;
        self.window_start = 0;
        self.actual_window_size = 1;
    }

    /// Start reassembling a segmented message from its first segment
    pub(crate) fn open_reassembly(&mut self, first: Apdu, window_limit: Option<usize>) {
        let requested = first.window_size().unwrap_or(1);
        self.actual_window_size = clamp_window(requested, window_limit);
        self.last_sequence_number = 0;
        self.initial_sequence_number = 0;
        self.segment_apdu = Some(first);
    }

    /// Build segment `index` of the message being sent
    pub fn get_segment(&self, index: usize) -> Result<Apdu> {
        let apdu = self
            .segment_apdu
            .as_ref()
            .ok_or(TransactionError::NoSegmentationContext)?;
        if index >= self.segment_count {
            return Err(TransactionError::InvalidSegmentIndex {
                index,
                count: self.segment_count,
            });
        }
        if self.segment_count == 1 {
            return Ok(apdu.clone());
        }

        let data = apdu.service_data();
        let start = (index * self.segment_size).min(data.len());
        let end = (start + self.segment_size).min(data.len());
        let more_follows = index < self.segment_count - 1;
        let sequence_number = Some((index % 256) as u8);
        let proposed_window_size = Some(self.proposed_window_size);

        match apdu {
            Apdu::ConfirmedRequest {
                segmented_response_accepted,
                max_segments,
                max_response_size,
                invoke_id,
                service_choice,
                ..
            } => Ok(Apdu::ConfirmedRequest {
                segmented: true,
                more_follows,
                segmented_response_accepted: *segmented_response_accepted,
                max_segments: *max_segments,
                max_response_size: *max_response_size,
                invoke_id: *invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice: *service_choice,
                service_data: data[start..end].to_vec(),
            }),
            Apdu::ComplexAck {
                invoke_id,
                service_choice,
                ..
            } => Ok(Apdu::ComplexAck {
                segmented: true,
                more_follows,
                invoke_id: *invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice: *service_choice,
                service_data: data[start..end].to_vec(),
            }),
            other => Err(TransactionError::UnexpectedApdu {
                kind: other.apdu_type(),
                state: self.state,
            }),
        }
    }

    /// Append the payload of a received segment to the reassembly buffer
    pub fn append_segment(&mut self, segment: &Apdu) -> Result<()> {
        let buffer = self
            .segment_apdu
            .as_mut()
            .ok_or(TransactionError::NoSegmentationContext)?;
        match buffer {
            Apdu::ConfirmedRequest { service_data, .. } | Apdu::ComplexAck { service_data, .. } => {
                service_data.extend_from_slice(segment.service_data());
                Ok(())
            }
            other => Err(TransactionError::UnexpectedApdu {
                kind: other.apdu_type(),
                state: self.state,
            }),
        }
    }

    /// Hand back the reassembled message with its segmentation header cleared
    pub(crate) fn take_reassembled(&mut self) -> Result<Apdu> {
        let mut apdu = self
            .segment_apdu
            .take()
            .ok_or(TransactionError::NoSegmentationContext)?;
        match &mut apdu {
            Apdu::ConfirmedRequest {
                segmented,
                more_follows,
                sequence_number,
                proposed_window_size,
                ..
            }
            | Apdu::ComplexAck {
                segmented,
                more_follows,
                sequence_number,
                proposed_window_size,
                ..
            } => {
                *segmented = false;
                *more_follows = false;
                *sequence_number = None;
                *proposed_window_size = None;
            }
            _ => {}
        }
        Ok(apdu)
    }

    /// Is `seq_a` within the current window starting at `seq_b`
    pub fn in_window(&self, seq_a: u8, seq_b: u8) -> bool {
        (seq_a.wrapping_sub(seq_b) as usize) < self.actual_window_size as usize
    }

    /// Send up to `actual_window_size` segments starting at segment `start`,
    /// returning how many went out
    pub(crate) fn fill_window(&mut self, ctx: &mut Context<'_>, start: usize) -> Result<usize> {
        let mut sent = 0;
        for index in start..start + self.actual_window_size as usize {
            if index >= self.segment_count {
                break;
            }
            let segment = self.get_segment(index)?;
            let last = !segment.more_follows();
            self.send(ctx, &segment);
            sent += 1;
            if last {
                self.sent_all_segments = true;
                break;
            }
        }
        debug!(
            "{} {}: sent {} segment(s) from {}, all sent: {}",
            self.role, self.invoke_id, sent, start, self.sent_all_segments
        );
        Ok(sent)
    }

    /// Resend the window that is waiting for an ack
    pub(crate) fn resend_window(&mut self, ctx: &mut Context<'_>) -> Result<usize> {
        self.sent_all_segments = false;
        self.fill_window(ctx, self.window_start)
    }

    /// Sending side of a segment ack
    pub(crate) fn process_segment_ack(
        &mut self,
        ctx: &mut Context<'_>,
        sequence_number: u8,
        window_size: u8,
    ) -> Result<AckReceived> {
        if !self.in_window(sequence_number, self.initial_sequence_number) {
            debug!(
                "{} {}: ack {} outside window at {}",
                self.role, self.invoke_id, sequence_number, self.initial_sequence_number
            );
            self.start_segment_timer(ctx);
            return Ok(AckReceived::Ignored);
        }

        let acked = self.window_start
            + sequence_number.wrapping_sub(self.initial_sequence_number) as usize;
        if self.sent_all_segments && acked + 1 >= self.segment_count {
            return Ok(AckReceived::AllAcked);
        }

        self.window_start = acked + 1;
        self.initial_sequence_number = sequence_number.wrapping_add(1);
        self.actual_window_size = window_size.clamp(1, self.proposed_window_size.max(1));
        self.segment_retry_count = 0;
        self.sent_all_segments = false;
        self.fill_window(ctx, self.window_start)?;
        self.start_segment_timer(ctx);
        Ok(AckReceived::WindowSent)
    }

    pub(crate) fn segment_ack(&self, negative: bool, sequence_number: u8) -> Apdu {
        Apdu::SegmentAck {
            negative,
            server: self.role == Role::Server,
            invoke_id: self.invoke_id,
            sequence_number,
            window_size: self.actual_window_size,
        }
    }

    /// Receiving side of one segment
    pub(crate) fn receive_segment(
        &mut self,
        ctx: &mut Context<'_>,
        segment: &Apdu,
    ) -> Result<SegmentReceived> {
        let sequence_number = segment.sequence_number().unwrap_or(0);
        if sequence_number != self.last_sequence_number.wrapping_add(1) {
            debug!(
                "{} {}: segment {} out of order, expected {}",
                self.role,
                self.invoke_id,
                sequence_number,
                self.last_sequence_number.wrapping_add(1)
            );
            let nak = self.segment_ack(true, self.last_sequence_number);
            self.send(ctx, &nak);
            self.start_segment_timer(ctx);
            return Ok(SegmentReceived::OutOfOrder);
        }

        self.append_segment(segment)?;
        self.last_sequence_number = sequence_number;

        if !segment.more_follows() {
            let ack = self.segment_ack(false, sequence_number);
            self.send(ctx, &ack);
            return Ok(SegmentReceived::Complete);
        }

        if sequence_number
            == self
                .initial_sequence_number
                .wrapping_add(self.actual_window_size)
        {
            self.initial_sequence_number = sequence_number;
            let ack = self.segment_ack(false, sequence_number);
            self.send(ctx, &ack);
            self.start_segment_timer(ctx);
            return Ok(SegmentReceived::WindowAcked);
        }

        self.start_segment_timer(ctx);
        Ok(SegmentReceived::InWindow)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use proptest::prelude::*;

    fn sending_ssm(payload_len: usize, segment_size: usize, window: u8) -> Ssm {
        let mut ssm = Ssm::new(Role::Server, peer(), 3);
        ssm.proposed_window_size = 16;
        ssm.load_outgoing(
            complex_ack(3, (0..payload_len).map(|i| i as u8).collect()),
            segment_size,
        );
        ssm.actual_window_size = window;
        ssm
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut harness = Harness::default();
        let mut ctx = harness.context();
        let mut ssm = Ssm::new(Role::Client, peer(), 1);

        ssm.set_state(
            &mut ctx,
            TransactionState::AwaitConfirmation,
            Some(Duration::from_secs(1)),
        )
        .unwrap();
        assert!(ssm.has_timer());
        ssm.set_state(&mut ctx, TransactionState::Completed, None).unwrap();
        assert!(!ssm.has_timer());

        for next in [
            TransactionState::Idle,
            TransactionState::Aborted,
            TransactionState::Completed,
        ] {
            assert_eq!(
                ssm.set_state(&mut ctx, next, None),
                Err(TransactionError::InvalidTransition {
                    from: TransactionState::Completed,
                    to: next,
                })
            );
        }
        drop(ctx);
        assert!(harness.scheduler.is_empty());
    }

    #[test]
    fn test_one_timer_per_machine() {
        let mut harness = Harness::default();
        let mut ctx = harness.context();
        let mut ssm = Ssm::new(Role::Server, peer(), 9);

        ssm.set_state(&mut ctx, TransactionState::AwaitResponse, Some(Duration::from_secs(3)))
            .unwrap();
        ssm.start_segment_timer(&mut ctx);
        ssm.start_segment_timer(&mut ctx);
        drop(ctx);
        assert_eq!(harness.scheduler.len(), 1);
    }

    #[test]
    fn test_get_segment_without_context() {
        let ssm = Ssm::new(Role::Client, peer(), 1);
        assert_eq!(ssm.get_segment(0), Err(TransactionError::NoSegmentationContext));

        let mut ssm = Ssm::new(Role::Client, peer(), 1);
        assert_eq!(
            ssm.append_segment(&complex_ack(1, vec![1])),
            Err(TransactionError::NoSegmentationContext)
        );
    }

    #[test]
    fn test_get_segment_headers() {
        let ssm = sending_ssm(100, 30, 1);
        assert_eq!(ssm.segment_count(), 4);
        assert_eq!(
            ssm.get_segment(4),
            Err(TransactionError::InvalidSegmentIndex { index: 4, count: 4 })
        );

        let first = ssm.get_segment(0).unwrap();
        assert!(first.is_segmented());
        assert!(first.more_follows());
        assert_eq!(first.sequence_number(), Some(0));
        assert_eq!(first.window_size(), Some(16));
        assert_eq!(first.service_data().len(), 30);

        let last = ssm.get_segment(3).unwrap();
        assert!(!last.more_follows());
        assert_eq!(last.service_data(), &(90..100).collect::<Vec<u8>>()[..]);
    }

    #[test]
    fn test_single_segment_is_unsegmented_copy() {
        let ssm = sending_ssm(50, 480, 1);
        assert_eq!(ssm.segment_count(), 1);
        let only = ssm.get_segment(0).unwrap();
        assert!(!only.is_segmented());
        assert_eq!(only.service_data().len(), 50);

        let empty = sending_ssm(0, 480, 1);
        assert_eq!(empty.segment_count(), 1);
    }

    #[test]
    fn test_request_segments_carry_request_header() {
        let mut ssm = Ssm::new(Role::Client, peer(), 77);
        ssm.proposed_window_size = 4;
        ssm.load_outgoing(confirmed_request(77, vec![0; 10]), 4);

        match ssm.get_segment(0).unwrap() {
            Apdu::ConfirmedRequest {
                segmented,
                segmented_response_accepted,
                max_segments,
                invoke_id,
                proposed_window_size,
                ..
            } => {
                assert!(segmented);
                assert!(segmented_response_accepted);
                assert_eq!(max_segments, crate::app::MaxSegments::SixtyFour);
                assert_eq!(invoke_id, 77);
                assert_eq!(proposed_window_size, Some(4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sequence_numbers_wrap() {
        let ssm = sending_ssm(300, 1, 1);
        assert_eq!(ssm.get_segment(255).unwrap().sequence_number(), Some(255));
        assert_eq!(ssm.get_segment(256).unwrap().sequence_number(), Some(0));
        assert_eq!(ssm.get_segment(299).unwrap().sequence_number(), Some(43));
    }

    #[test]
    fn test_fill_window_stops_at_last_segment() {
        let mut harness = Harness::default();
        let mut ssm = sending_ssm(100, 30, 8);

        let sent = ssm.fill_window(&mut harness.context(), 2).unwrap();
        assert_eq!(sent, 2);
        assert!(ssm.sent_all_segments());
        assert_eq!(harness.take_sent().len(), 2);
    }

    #[test]
    fn test_segment_ack_advances_window() {
        let mut harness = Harness::default();
        let mut ssm = sending_ssm(7 * 480, 480, 1);
        let mut ctx = harness.context();

        ssm.fill_window(&mut ctx, 0).unwrap();
        // duplicate of nothing sent yet
        assert_eq!(ssm.process_segment_ack(&mut ctx, 5, 4).unwrap(), AckReceived::Ignored);
        assert_eq!(ssm.process_segment_ack(&mut ctx, 0, 4).unwrap(), AckReceived::WindowSent);
        assert_eq!(ssm.actual_window_size(), 4);
        assert_eq!(ssm.process_segment_ack(&mut ctx, 4, 4).unwrap(), AckReceived::WindowSent);
        assert!(ssm.sent_all_segments());
        assert_eq!(ssm.process_segment_ack(&mut ctx, 6, 4).unwrap(), AckReceived::AllAcked);
        drop(ctx);

        let sequence: Vec<u8> = harness
            .take_sent()
            .iter()
            .filter_map(Apdu::sequence_number)
            .collect();
        assert_eq!(sequence, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_partial_ack_after_last_window_resends_rest() {
        let mut harness = Harness::default();
        let mut ssm = sending_ssm(4 * 10, 10, 1);
        let mut ctx = harness.context();

        ssm.fill_window(&mut ctx, 0).unwrap();
        ssm.process_segment_ack(&mut ctx, 0, 3).unwrap();
        assert!(ssm.sent_all_segments());
        // peer only got segment 1 of 1..=3
        assert_eq!(ssm.process_segment_ack(&mut ctx, 1, 3).unwrap(), AckReceived::WindowSent);
        drop(ctx);

        let sequence: Vec<u8> = harness
            .take_sent()
            .iter()
            .filter_map(Apdu::sequence_number)
            .collect();
        assert_eq!(sequence, vec![0, 1, 2, 3, 2, 3]);
    }

    #[test]
    fn test_receive_segments_and_nak() {
        let mut harness = Harness::default();
        let mut ssm = Ssm::new(Role::Client, peer(), 5);
        let mut ctx = harness.context();

        ssm.open_reassembly(segment(5, 0, true, 2, vec![0, 1]), Some(64));
        assert_eq!(ssm.actual_window_size(), 2);

        let out_of_order = segment(5, 2, true, 2, vec![4, 5]);
        assert_eq!(
            ssm.receive_segment(&mut ctx, &out_of_order).unwrap(),
            SegmentReceived::OutOfOrder
        );
        assert_eq!(
            ssm.receive_segment(&mut ctx, &segment(5, 1, true, 2, vec![2, 3])).unwrap(),
            SegmentReceived::InWindow
        );
        assert_eq!(
            ssm.receive_segment(&mut ctx, &out_of_order).unwrap(),
            SegmentReceived::WindowAcked
        );
        assert_eq!(
            ssm.receive_segment(&mut ctx, &segment(5, 3, false, 2, vec![6])).unwrap(),
            SegmentReceived::Complete
        );
        drop(ctx);

        let acks = harness.take_sent();
        assert_eq!(
            acks,
            vec![
                Apdu::SegmentAck {
                    negative: true,
                    server: false,
                    invoke_id: 5,
                    sequence_number: 0,
                    window_size: 2,
                },
                Apdu::SegmentAck {
                    negative: false,
                    server: false,
                    invoke_id: 5,
                    sequence_number: 2,
                    window_size: 2,
                },
                Apdu::SegmentAck {
                    negative: false,
                    server: false,
                    invoke_id: 5,
                    sequence_number: 3,
                    window_size: 2,
                },
            ]
        );

        let whole = ssm.take_reassembled().unwrap();
        assert!(!whole.is_segmented());
        assert_eq!(whole.service_data(), &[0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_window_clamping() {
        assert_eq!(clamp_window(16, Some(4)), 4);
        assert_eq!(clamp_window(0, None), 1);
        assert_eq!(clamp_window(200, None), 127);
        assert_eq!(clamp_window(8, Some(1000)), 8);
        assert_eq!(segment_count_for(3000, 480), 7);
        assert_eq!(segment_count_for(0, 480), 1);
    }

    proptest! {
        #[test]
        fn prop_in_window_matches_modular_distance(
            a in any::<u8>(),
            b in any::<u8>(),
            window in 1u8..=127,
        ) {
            let mut ssm = Ssm::new(Role::Client, peer(), 0);
            ssm.actual_window_size = window;
            let expected = ((a as usize + 256 - b as usize) % 256) < window as usize;
            prop_assert_eq!(ssm.in_window(a, b), expected);
        }

        #[test]
        fn prop_segments_reassemble_to_original(
            payload in proptest::collection::vec(any::<u8>(), 0..2000),
            segment_size in 1usize..600,
        ) {
            let mut sender = Ssm::new(Role::Server, peer(), 1);
            sender.load_outgoing(complex_ack(1, payload.clone()), segment_size);
            let count = sender.segment_count();
            prop_assert_eq!(count, payload.len().div_ceil(segment_size).max(1));

            let mut receiver = Ssm::new(Role::Client, peer(), 1);
            for index in 0..count {
                let segment = sender.get_segment(index).unwrap();
                prop_assert_eq!(segment.more_follows(), index + 1 < count);
                if index == 0 {
                    receiver.open_reassembly(segment, None);
                } else {
                    receiver.append_segment(&segment).unwrap();
                }
            }
            let whole = receiver.take_reassembled().unwrap();
            prop_assert_eq!(whole.service_data(), &payload[..]);
        }

        #[test]
        fn prop_fill_window_sends_min_of_window_and_remaining(
            count in 1usize..40,
            window in 1u8..20,
            start_offset in 0usize..40,
        ) {
            let start = start_offset % count;
            let mut harness = Harness::default();
            let mut ssm = sending_ssm(count * 3, 3, window);

            let sent = ssm.fill_window(&mut harness.context(), start).unwrap();
            let remaining = count - start;
            prop_assert_eq!(sent, remaining.min(window as usize));
            let last_sent = harness.take_sent().pop().unwrap();
            prop_assert_eq!(ssm.sent_all_segments(), !last_sent.more_follows());
        }
    }
}
