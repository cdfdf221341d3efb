use log::debug;

use super::{
    clamp_window, AckReceived, Context, Result, Role, SegmentReceived, Ssm, TransactionError,
    TransactionState,
};
use crate::app::{AbortReason, Apdu, ApplicationConfig, MaxApduSize, MaxSegments};
use crate::network::Address;

/// State machine for a confirmed request initiated by this device
#[derive(Debug)]
pub struct ClientSsm {
    ssm: Ssm,
}

impl ClientSsm {
    pub(crate) fn new(address: Address, invoke_id: u8) -> Self {
        Self {
            ssm: Ssm::new(Role::Client, address, invoke_id),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.ssm.state()
    }

    pub fn invoke_id(&self) -> u8 {
        self.ssm.invoke_id()
    }

    pub fn address(&self) -> &Address {
        self.ssm.address()
    }

    /// Segmentation details of the transaction
    pub fn ssm(&self) -> &Ssm {
        &self.ssm
    }

    /// Drop the outstanding timer of a machine that is being discarded
    pub(crate) fn discard(&mut self, ctx: &mut Context<'_>) {
        self.ssm.stop_timer(ctx);
    }

    pub(crate) fn take_expired_timer(&mut self, handle: crate::timer::TimerHandle) -> bool {
        self.ssm.take_expired_timer(handle)
    }

    /// Start (or restart, on retry) sending `apdu`
    pub(crate) fn begin(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Result<()> {
        let apdu = stamp_request(apdu, self.ssm.invoke_id, ctx.config)?;
        let remote = ctx.directory.lookup(&self.ssm.address);

        let segment_size =
            (ctx.config.max_apdu_length as usize).min(remote.max_apdu_length_accepted);
        self.ssm.max_segments_accepted = remote.max_segments_accepted;
        self.ssm.proposed_window_size =
            clamp_window(ctx.config.proposed_window_size, remote.max_segments_accepted);
        let remote_receives = remote.segmentation_supported.can_receive();
        self.ssm.remote_device = Some(remote);
        self.ssm.load_outgoing(apdu, segment_size);

        let count = self.ssm.segment_count;
        debug!(
            "client {} to {}: {} segment(s) of up to {} octets",
            self.ssm.invoke_id, self.ssm.address, count, segment_size
        );

        if count > 1 {
            if !ctx.config.segmentation.can_transmit() || !remote_receives {
                return self.ssm.abort_local(ctx, AbortReason::SegmentationNotSupported);
            }
            if let Some(limit) = self.ssm.max_segments_accepted {
                if count > limit {
                    return self.ssm.abort_local(ctx, AbortReason::ApduTooLong);
                }
            }
            let timeout = ctx.config.segment_timeout();
            self.ssm
                .set_state(ctx, TransactionState::SegmentedRequest, Some(timeout))?;
        } else {
            let timeout = ctx.config.apdu_timeout();
            self.ssm
                .set_state(ctx, TransactionState::AwaitConfirmation, Some(timeout))?;
        }

        self.ssm.fill_window(ctx, 0)?;
        Ok(())
    }

    /// Handle a PDU from the server
    pub(crate) fn on_network_pdu(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Result<()> {
        match self.ssm.state {
            TransactionState::SegmentedRequest => self.segmented_request(ctx, apdu),
            TransactionState::AwaitConfirmation => self.await_confirmation(ctx, apdu),
            TransactionState::SegmentedConfirmation => self.segmented_confirmation(ctx, apdu),
            state => Err(TransactionError::UnexpectedApdu {
                kind: apdu.apdu_type(),
                state,
            }),
        }
    }

    /// Handle expiry of this machine's timer
    pub(crate) fn on_timeout(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        match self.ssm.state {
            TransactionState::SegmentedRequest => {
                if self.ssm.segment_retry_count < ctx.config.apdu_retries {
                    self.ssm.segment_retry_count += 1;
                    debug!(
                        "client {}: no segment ack, resending window (retry {})",
                        self.ssm.invoke_id, self.ssm.segment_retry_count
                    );
                    self.ssm.resend_window(ctx)?;
                    self.ssm.start_segment_timer(ctx);
                    Ok(())
                } else {
                    self.ssm.abort_local(ctx, AbortReason::NoResponse)
                }
            }
            TransactionState::AwaitConfirmation => {
                if self.ssm.retry_count < ctx.config.apdu_retries {
                    self.ssm.retry_count += 1;
                    debug!(
                        "client {}: no confirmation, resending request (retry {})",
                        self.ssm.invoke_id, self.ssm.retry_count
                    );
                    let request = self
                        .ssm
                        .segment_apdu
                        .clone()
                        .ok_or(TransactionError::NoSegmentationContext)?;
                    self.begin(ctx, request)
                } else {
                    self.ssm.abort_local(ctx, AbortReason::NoResponse)
                }
            }
            TransactionState::SegmentedConfirmation => {
                self.ssm.abort_local(ctx, AbortReason::NoResponse)
            }
            state => {
                debug!("client {}: timer expired in {:?}", self.ssm.invoke_id, state);
                Ok(())
            }
        }
    }

    /// Give up on the request at the application's request
    pub(crate) fn cancel(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        self.ssm.abort_peer(ctx, AbortReason::Other)
    }

    fn segmented_request(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::SegmentAck {
                sequence_number,
                window_size,
                ..
            } => {
                if window_size == 0 {
                    return self.ssm.abort_both(ctx, AbortReason::WindowSizeOutOfRange);
                }
                match self
                    .ssm
                    .process_segment_ack(ctx, sequence_number, window_size)?
                {
                    AckReceived::AllAcked => {
                        let timeout = ctx.config.apdu_timeout();
                        self.ssm
                            .set_state(ctx, TransactionState::AwaitConfirmation, Some(timeout))
                    }
                    AckReceived::Ignored | AckReceived::WindowSent => Ok(()),
                }
            }
            Apdu::SimpleAck { .. }
            | Apdu::Error { .. }
            | Apdu::Reject { .. }
            | Apdu::Abort { .. } => {
                if !self.ssm.sent_all_segments {
                    return self.ssm.abort_both(ctx, AbortReason::InvalidApduInThisState);
                }
                self.complete(ctx, apdu)
            }
            Apdu::ComplexAck { segmented, .. } => {
                if !self.ssm.sent_all_segments {
                    self.ssm.abort_both(ctx, AbortReason::InvalidApduInThisState)
                } else if segmented {
                    self.start_segmented_confirmation(ctx, apdu)
                } else {
                    self.complete(ctx, apdu)
                }
            }
            other => Err(TransactionError::UnexpectedApdu {
                kind: other.apdu_type(),
                state: self.ssm.state,
            }),
        }
    }

    fn await_confirmation(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::Abort { .. } => self.peer_abort(ctx, apdu),
            Apdu::SimpleAck { .. } | Apdu::Error { .. } | Apdu::Reject { .. } => {
                self.complete(ctx, apdu)
            }
            Apdu::ComplexAck { segmented, .. } => {
                if segmented {
                    self.start_segmented_confirmation(ctx, apdu)
                } else {
                    self.complete(ctx, apdu)
                }
            }
            Apdu::SegmentAck { sequence_number, .. } => {
                // repeat of the ack for our final segment
                debug!(
                    "client {}: ignoring segment ack {} while awaiting confirmation",
                    self.ssm.invoke_id, sequence_number
                );
                Ok(())
            }
            other => Err(TransactionError::UnexpectedApdu {
                kind: other.apdu_type(),
                state: self.ssm.state,
            }),
        }
    }

    fn segmented_confirmation(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::ComplexAck {
                segmented: true, ..
            } => match self.ssm.receive_segment(ctx, &apdu)? {
                SegmentReceived::Complete => self.complete_reassembly(ctx),
                _ => Ok(()),
            },
            Apdu::Abort { .. } => self.peer_abort(ctx, apdu),
            _ => self.ssm.abort_both(ctx, AbortReason::InvalidApduInThisState),
        }
    }

    fn start_segmented_confirmation(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Result<()> {
        if !ctx.config.segmentation.can_receive() {
            return self
                .ssm
                .abort_both(ctx, AbortReason::SegmentationNotSupported);
        }
        if apdu.sequence_number() != Some(0) {
            return self.ssm.abort_both(ctx, AbortReason::InvalidApduInThisState);
        }
        if apdu.window_size() == Some(0) {
            return self.ssm.abort_both(ctx, AbortReason::WindowSizeOutOfRange);
        }

        let last = !apdu.more_follows();
        self.ssm.open_reassembly(apdu, ctx.config.max_segments);
        let ack = self.ssm.segment_ack(false, 0);
        self.ssm.send(ctx, &ack);
        if last {
            return self.complete_reassembly(ctx);
        }
        let timeout = ctx.config.segment_timeout();
        self.ssm
            .set_state(ctx, TransactionState::SegmentedConfirmation, Some(timeout))
    }

    fn complete_reassembly(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        let response = self.ssm.take_reassembled()?;
        self.complete(ctx, response)
    }

    fn complete(&mut self, ctx: &mut Context<'_>, response: Apdu) -> Result<()> {
        self.ssm.set_state(ctx, TransactionState::Completed, None)?;
        self.ssm.deliver(ctx, response);
        Ok(())
    }

    fn peer_abort(&mut self, ctx: &mut Context<'_>, abort: Apdu) -> Result<()> {
        self.ssm.set_state(ctx, TransactionState::Aborted, None)?;
        self.ssm.deliver(ctx, abort);
        Ok(())
    }
}

/// Normalise a request for sending: unsegmented header carrying this
/// transaction's invoke ID and the local device's limits
fn stamp_request(apdu: Apdu, invoke_id: u8, config: &ApplicationConfig) -> Result<Apdu> {
    match apdu {
        Apdu::ConfirmedRequest {
            service_choice,
            service_data,
            ..
        } => Ok(Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: config.segmentation.can_receive(),
            max_segments: MaxSegments::from_limit(config.max_segments),
            max_response_size: MaxApduSize::from_length(config.max_apdu_length as usize),
            invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice,
            service_data,
        }),
        other => Err(TransactionError::NotAConfirmedRequest(other.apdu_type())),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::device::{DeviceInfo, Segmentation};

    fn segmenting_peer(harness: &mut Harness, max_apdu: usize, max_segments: Option<usize>) {
        harness.directory.update(
            DeviceInfo::new(peer())
                .with_segmentation(Segmentation::Both)
                .with_max_apdu_length(max_apdu)
                .with_max_segments(max_segments),
        );
    }

    #[test]
    fn test_unsegmented_request_and_simple_ack() {
        let mut harness = Harness::default();
        let mut client = ClientSsm::new(peer(), 1);

        client
            .begin(&mut harness.context(), confirmed_request(99, vec![1, 2, 3]))
            .unwrap();
        assert_eq!(client.state(), TransactionState::AwaitConfirmation);

        let sent = harness.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].invoke_id(), Some(1));
        assert!(!sent[0].is_segmented());

        let ack = Apdu::SimpleAck {
            invoke_id: 1,
            service_choice: 15,
        };
        client.on_network_pdu(&mut harness.context(), ack.clone()).unwrap();
        assert_eq!(client.state(), TransactionState::Completed);
        assert_eq!(harness.application.confirmations, vec![(ack, peer())]);
        assert!(harness.scheduler.is_empty());
    }

    #[test]
    fn test_rejects_non_request() {
        let mut harness = Harness::default();
        let mut client = ClientSsm::new(peer(), 1);
        assert_eq!(
            client.begin(&mut harness.context(), complex_ack(1, vec![])),
            Err(TransactionError::NotAConfirmedRequest(crate::app::ApduType::ComplexAck))
        );
    }

    #[test]
    fn test_segmentation_refused_by_peer() {
        let mut harness = Harness::default();
        let mut client = ClientSsm::new(peer(), 2);

        client
            .begin(&mut harness.context(), confirmed_request(2, vec![0; 3000]))
            .unwrap();
        assert_eq!(client.state(), TransactionState::Aborted);
        assert!(harness.take_sent().is_empty());
        let (abort, _) = &harness.application.confirmations[0];
        assert_eq!(
            abort,
            &Apdu::Abort {
                server: false,
                invoke_id: 2,
                abort_reason: AbortReason::SegmentationNotSupported.into(),
            }
        );
    }

    #[test]
    fn test_too_many_segments_for_peer() {
        let mut harness = Harness::default();
        segmenting_peer(&mut harness, 480, Some(4));
        let mut client = ClientSsm::new(peer(), 2);

        client
            .begin(&mut harness.context(), confirmed_request(2, vec![0; 3000]))
            .unwrap();
        assert_eq!(client.state(), TransactionState::Aborted);
        assert_eq!(
            harness.application.confirmations[0].0,
            Apdu::Abort {
                server: false,
                invoke_id: 2,
                abort_reason: AbortReason::ApduTooLong.into(),
            }
        );
    }

    #[test]
    fn test_early_response_is_protocol_violation() {
        let mut harness = Harness::default();
        segmenting_peer(&mut harness, 480, None);
        let mut client = ClientSsm::new(peer(), 3);

        client
            .begin(&mut harness.context(), confirmed_request(3, vec![0; 1000]))
            .unwrap();
        assert_eq!(client.state(), TransactionState::SegmentedRequest);
        harness.take_sent();

        client
            .on_network_pdu(
                &mut harness.context(),
                Apdu::SimpleAck {
                    invoke_id: 3,
                    service_choice: 15,
                },
            )
            .unwrap();
        assert_eq!(client.state(), TransactionState::Aborted);
        let expected = Apdu::Abort {
            server: false,
            invoke_id: 3,
            abort_reason: AbortReason::InvalidApduInThisState.into(),
        };
        assert_eq!(harness.take_sent(), vec![expected.clone()]);
        assert_eq!(harness.application.confirmations[0].0, expected);
    }

    #[test]
    fn test_zero_window_ack_aborts() {
        let mut harness = Harness::default();
        segmenting_peer(&mut harness, 480, None);
        let mut client = ClientSsm::new(peer(), 4);
        client
            .begin(&mut harness.context(), confirmed_request(4, vec![0; 1000]))
            .unwrap();

        client
            .on_network_pdu(
                &mut harness.context(),
                Apdu::SegmentAck {
                    negative: false,
                    server: true,
                    invoke_id: 4,
                    sequence_number: 0,
                    window_size: 0,
                },
            )
            .unwrap();
        assert_eq!(client.state(), TransactionState::Aborted);
        assert_eq!(
            harness.application.confirmations[0].0,
            Apdu::Abort {
                server: false,
                invoke_id: 4,
                abort_reason: AbortReason::WindowSizeOutOfRange.into(),
            }
        );
    }

    #[test]
    fn test_segmented_confirmation_reassembles() {
        let mut harness = Harness::default();
        let mut client = ClientSsm::new(peer(), 5);
        client
            .begin(&mut harness.context(), confirmed_request(5, vec![7]))
            .unwrap();
        harness.take_sent();

        let mut ctx = harness.context();
        client
            .on_network_pdu(&mut ctx, segment(5, 0, true, 2, vec![1, 2]))
            .unwrap();
        assert_eq!(client.state(), TransactionState::SegmentedConfirmation);
        client
            .on_network_pdu(&mut ctx, segment(5, 1, true, 2, vec![3, 4]))
            .unwrap();
        client
            .on_network_pdu(&mut ctx, segment(5, 2, false, 2, vec![5]))
            .unwrap();
        drop(ctx);

        assert_eq!(client.state(), TransactionState::Completed);
        let acked: Vec<u8> = harness
            .take_sent()
            .iter()
            .filter_map(|apdu| match apdu {
                Apdu::SegmentAck {
                    sequence_number, ..
                } => Some(*sequence_number),
                _ => None,
            })
            .collect();
        // window of two: the first segment, then the final one
        assert_eq!(acked, vec![0, 2]);

        let (response, _) = &harness.application.confirmations[0];
        assert!(!response.is_segmented());
        assert_eq!(response.service_data(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_first_segment_must_be_zero() {
        let mut harness = Harness::default();
        let mut client = ClientSsm::new(peer(), 6);
        client
            .begin(&mut harness.context(), confirmed_request(6, vec![7]))
            .unwrap();

        client
            .on_network_pdu(&mut harness.context(), segment(6, 3, true, 2, vec![1]))
            .unwrap();
        assert_eq!(client.state(), TransactionState::Aborted);
        assert_eq!(
            harness.application.confirmations[0].0,
            Apdu::Abort {
                server: false,
                invoke_id: 6,
                abort_reason: AbortReason::InvalidApduInThisState.into(),
            }
        );
    }

    #[test]
    fn test_cannot_receive_segmented_response() {
        let mut harness = Harness::default();
        harness.config.segmentation = Segmentation::Transmit;
        let mut client = ClientSsm::new(peer(), 7);
        client
            .begin(&mut harness.context(), confirmed_request(7, vec![7]))
            .unwrap();
        match &harness.take_sent()[0] {
            Apdu::ConfirmedRequest {
                segmented_response_accepted,
                ..
            } => assert!(!segmented_response_accepted),
            other => panic!("unexpected {other:?}"),
        }

        client
            .on_network_pdu(&mut harness.context(), segment(7, 0, true, 2, vec![1]))
            .unwrap();
        assert_eq!(client.state(), TransactionState::Aborted);
        assert_eq!(
            harness.take_sent()[0],
            Apdu::Abort {
                server: false,
                invoke_id: 7,
                abort_reason: AbortReason::SegmentationNotSupported.into(),
            }
        );
    }

    #[test]
    fn test_peer_abort_is_delivered() {
        let mut harness = Harness::default();
        let mut client = ClientSsm::new(peer(), 8);
        client
            .begin(&mut harness.context(), confirmed_request(8, vec![]))
            .unwrap();
        harness.take_sent();

        let abort = Apdu::Abort {
            server: true,
            invoke_id: 8,
            abort_reason: AbortReason::OutOfResources.into(),
        };
        client.on_network_pdu(&mut harness.context(), abort.clone()).unwrap();
        assert_eq!(client.state(), TransactionState::Aborted);
        assert!(harness.take_sent().is_empty());
        assert_eq!(harness.application.confirmations[0].0, abort);
    }

    #[test]
    fn test_retries_then_no_response() {
        let mut harness = Harness::default();
        harness.config.apdu_retries = 2;
        let mut client = ClientSsm::new(peer(), 9);
        client
            .begin(&mut harness.context(), confirmed_request(9, vec![1]))
            .unwrap();

        for _ in 0..3 {
            client.on_timeout(&mut harness.context()).unwrap();
        }
        assert_eq!(client.state(), TransactionState::Aborted);
        assert_eq!(client.ssm().retry_count(), 2);
        // original plus two retries
        assert_eq!(harness.take_sent().len(), 3);
        assert_eq!(
            harness.application.confirmations[0].0,
            Apdu::Abort {
                server: false,
                invoke_id: 9,
                abort_reason: AbortReason::NoResponse.into(),
            }
        );
    }

    #[test]
    fn test_cancel_sends_abort() {
        let mut harness = Harness::default();
        let mut client = ClientSsm::new(peer(), 10);
        client
            .begin(&mut harness.context(), confirmed_request(10, vec![1]))
            .unwrap();
        harness.take_sent();

        client.cancel(&mut harness.context()).unwrap();
        assert_eq!(client.state(), TransactionState::Aborted);
        assert_eq!(
            harness.take_sent(),
            vec![Apdu::Abort {
                server: false,
                invoke_id: 10,
                abort_reason: 0,
            }]
        );
        assert!(harness.application.confirmations.is_empty());
        assert_eq!(
            client.cancel(&mut harness.context()),
            Err(TransactionError::InvalidTransition {
                from: TransactionState::Aborted,
                to: TransactionState::Aborted,
            })
        );
    }
}
