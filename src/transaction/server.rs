use log::{debug, warn};

use super::{
    clamp_window, AckReceived, Context, Result, Role, SegmentReceived, Ssm, TransactionError,
    TransactionState,
};
use crate::app::{AbortReason, Apdu};
use crate::network::Address;
use crate::timer::TimerHandle;

/// State machine for a confirmed request received from a peer
#[derive(Debug)]
pub struct ServerSsm {
    ssm: Ssm,
    segmented_response_accepted: bool,
    // max-response size the requester announced
    max_response_size: usize,
}

impl ServerSsm {
    pub(crate) fn new(address: Address, invoke_id: u8) -> Self {
        Self {
            ssm: Ssm::new(Role::Server, address, invoke_id),
            segmented_response_accepted: false,
            max_response_size: crate::BACNET_MAX_APDU,
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

    pub fn ssm(&self) -> &Ssm {
        &self.ssm
    }

    /// Did the requester say it can take a segmented response
    pub fn segmented_response_accepted(&self) -> bool {
        self.segmented_response_accepted
    }

    pub(crate) fn discard(&mut self, ctx: &mut Context<'_>) {
        self.ssm.stop_timer(ctx);
    }

    pub(crate) fn take_expired_timer(&mut self, handle: TimerHandle) -> bool {
        self.ssm.take_expired_timer(handle)
    }

    /// Handle a PDU from the client
    pub(crate) fn on_network_pdu(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Result<()> {
        match self.ssm.state {
            TransactionState::Idle => self.idle(ctx, apdu),
            TransactionState::SegmentedRequest => self.segmented_request(ctx, apdu),
            TransactionState::AwaitResponse => self.await_response(ctx, apdu),
            TransactionState::SegmentedResponse => self.segmented_response(ctx, apdu),
            state => Err(TransactionError::UnexpectedApdu {
                kind: apdu.apdu_type(),
                state,
            }),
        }
    }

    /// Handle the application's answer to the request
    pub(crate) fn on_response(&mut self, ctx: &mut Context<'_>, mut apdu: Apdu) -> Result<()> {
        if self.ssm.state != TransactionState::AwaitResponse {
            return Err(TransactionError::UnexpectedApdu {
                kind: apdu.apdu_type(),
                state: self.ssm.state,
            });
        }

        apdu.set_invoke_id(self.ssm.invoke_id);
        match apdu {
            Apdu::Abort { abort_reason, .. } => {
                let abort = Apdu::Abort {
                    server: true,
                    invoke_id: self.ssm.invoke_id,
                    abort_reason,
                };
                self.ssm.set_state(ctx, TransactionState::Completed, None)?;
                self.ssm.send(ctx, &abort);
                Ok(())
            }
            Apdu::SimpleAck { .. } | Apdu::Error { .. } | Apdu::Reject { .. } => {
                self.ssm.set_state(ctx, TransactionState::Completed, None)?;
                self.ssm.send(ctx, &apdu);
                Ok(())
            }
            Apdu::ComplexAck {
                invoke_id,
                service_choice,
                service_data,
                ..
            } => {
                let response = Apdu::ComplexAck {
                    segmented: false,
                    more_follows: false,
                    invoke_id,
                    sequence_number: None,
                    proposed_window_size: None,
                    service_choice,
                    service_data,
                };
                self.send_complex_ack(ctx, response)
            }
            other => Err(TransactionError::UnexpectedApdu {
                kind: other.apdu_type(),
                state: self.ssm.state,
            }),
        }
    }

    /// Handle expiry of this machine's timer
    pub(crate) fn on_timeout(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        match self.ssm.state {
            TransactionState::SegmentedRequest => {
                warn!(
                    "server {} from {}: gave up waiting for request segments",
                    self.ssm.invoke_id, self.ssm.address
                );
                self.ssm.set_state(ctx, TransactionState::Aborted, None)
            }
            TransactionState::AwaitResponse => {
                self.ssm.abort_peer(ctx, AbortReason::ServerTimeout)
            }
            TransactionState::SegmentedResponse => {
                if self.ssm.segment_retry_count < ctx.config.apdu_retries {
                    self.ssm.segment_retry_count += 1;
                    debug!(
                        "server {}: no segment ack, resending window (retry {})",
                        self.ssm.invoke_id, self.ssm.segment_retry_count
                    );
                    self.ssm.resend_window(ctx)?;
                    self.ssm.start_segment_timer(ctx);
                    Ok(())
                } else {
                    warn!(
                        "server {} from {}: response segments never acknowledged",
                        self.ssm.invoke_id, self.ssm.address
                    );
                    self.ssm.set_state(ctx, TransactionState::Aborted, None)
                }
            }
            state => {
                debug!("server {}: timer expired in {:?}", self.ssm.invoke_id, state);
                Ok(())
            }
        }
    }

    fn idle(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Result<()> {
        let (segmented, segmented_response_accepted, max_segments, max_response_size) = match &apdu
        {
            Apdu::ConfirmedRequest {
                segmented,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                ..
            } => (
                *segmented,
                *segmented_response_accepted,
                *max_segments,
                *max_response_size,
            ),
            other => return Err(TransactionError::NotAConfirmedRequest(other.apdu_type())),
        };

        self.ssm.remote_device = Some(ctx.directory.lookup(&self.ssm.address));
        self.segmented_response_accepted = segmented_response_accepted;
        self.ssm.max_segments_accepted = max_segments.limit();
        self.max_response_size = max_response_size.size();

        if !segmented {
            let timeout = ctx.config.application_timeout();
            self.ssm
                .set_state(ctx, TransactionState::AwaitResponse, Some(timeout))?;
            self.ssm.deliver(ctx, apdu);
            return Ok(());
        }

        if !ctx.config.segmentation.can_receive() {
            return self.ssm.abort_peer(ctx, AbortReason::SegmentationNotSupported);
        }
        if apdu.sequence_number() != Some(0) {
            return self.ssm.abort_peer(ctx, AbortReason::InvalidApduInThisState);
        }
        if apdu.window_size() == Some(0) {
            return self.ssm.abort_peer(ctx, AbortReason::WindowSizeOutOfRange);
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
            .set_state(ctx, TransactionState::SegmentedRequest, Some(timeout))
    }

    fn segmented_request(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::ConfirmedRequest {
                segmented: true, ..
            } => match self.ssm.receive_segment(ctx, &apdu)? {
                SegmentReceived::Complete => self.complete_reassembly(ctx),
                _ => Ok(()),
            },
            Apdu::Abort { .. } => {
                debug!("server {}: client abandoned segmented request", self.ssm.invoke_id);
                self.ssm.set_state(ctx, TransactionState::Completed, None)
            }
            _ => self.ssm.abort_peer(ctx, AbortReason::InvalidApduInThisState),
        }
    }

    fn await_response(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::ConfirmedRequest { .. } => {
                debug!(
                    "server {}: ignoring retransmitted request from {}",
                    self.ssm.invoke_id, self.ssm.address
                );
                Ok(())
            }
            Apdu::SegmentAck { .. } => {
                debug!("server {}: ignoring late segment ack", self.ssm.invoke_id);
                Ok(())
            }
            Apdu::Abort { .. } => {
                self.ssm.set_state(ctx, TransactionState::Aborted, None)?;
                self.ssm.deliver(ctx, apdu);
                Ok(())
            }
            other => Err(TransactionError::UnexpectedApdu {
                kind: other.apdu_type(),
                state: self.ssm.state,
            }),
        }
    }

    fn segmented_response(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::SegmentAck {
                sequence_number,
                window_size,
                ..
            } => {
                if window_size == 0 {
                    return self.ssm.abort_peer(ctx, AbortReason::WindowSizeOutOfRange);
                }
                match self
                    .ssm
                    .process_segment_ack(ctx, sequence_number, window_size)?
                {
                    AckReceived::AllAcked => {
                        self.ssm.set_state(ctx, TransactionState::Completed, None)
                    }
                    AckReceived::Ignored | AckReceived::WindowSent => Ok(()),
                }
            }
            Apdu::Abort { .. } => {
                debug!("server {}: client abandoned segmented response", self.ssm.invoke_id);
                self.ssm.set_state(ctx, TransactionState::Completed, None)
            }
            Apdu::ConfirmedRequest { .. } => {
                debug!(
                    "server {}: ignoring retransmitted request while responding",
                    self.ssm.invoke_id
                );
                Ok(())
            }
            other => Err(TransactionError::UnexpectedApdu {
                kind: other.apdu_type(),
                state: self.ssm.state,
            }),
        }
    }

    fn complete_reassembly(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        let request = self.ssm.take_reassembled()?;
        let timeout = ctx.config.application_timeout();
        self.ssm
            .set_state(ctx, TransactionState::AwaitResponse, Some(timeout))?;
        self.ssm.deliver(ctx, request);
        Ok(())
    }

    fn send_complex_ack(&mut self, ctx: &mut Context<'_>, response: Apdu) -> Result<()> {
        let remote_max = self
            .ssm
            .remote_device
            .as_ref()
            .map_or(crate::BACNET_MAX_APDU, |device| device.max_apdu_length_accepted);
        let segment_size = (ctx.config.max_apdu_length as usize)
            .min(self.max_response_size)
            .min(remote_max);
        self.ssm.proposed_window_size =
            clamp_window(ctx.config.proposed_window_size, self.ssm.max_segments_accepted);
        self.ssm.load_outgoing(response, segment_size);

        let count = self.ssm.segment_count;
        debug!(
            "server {} to {}: response in {} segment(s) of up to {} octets",
            self.ssm.invoke_id, self.ssm.address, count, segment_size
        );

        if count > 1 {
            if !ctx.config.segmentation.can_transmit() || !self.segmented_response_accepted {
                return self
                    .ssm
                    .abort_both(ctx, AbortReason::SegmentationNotSupported);
            }
            if let Some(limit) = self.ssm.max_segments_accepted {
                if count > limit {
                    return self.ssm.abort_both(ctx, AbortReason::ApduTooLong);
                }
            }
            let timeout = ctx.config.segment_timeout();
            self.ssm
                .set_state(ctx, TransactionState::SegmentedResponse, Some(timeout))?;
        } else {
            self.ssm.set_state(ctx, TransactionState::Completed, None)?;
        }

        self.ssm.fill_window(ctx, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::app::{MaxApduSize, MaxSegments};
    use crate::device::Segmentation;

    fn request_segment(
        invoke_id: u8,
        sequence_number: u8,
        more_follows: bool,
        payload: Vec<u8>,
    ) -> Apdu {
        Apdu::ConfirmedRequest {
            segmented: true,
            more_follows,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Sixteen,
            max_response_size: MaxApduSize::Up480,
            invoke_id,
            sequence_number: Some(sequence_number),
            proposed_window_size: Some(4),
            service_choice: 15,
            service_data: payload,
        }
    }

    fn awaiting_response(harness: &mut Harness, request: Apdu) -> ServerSsm {
        let invoke_id = request.invoke_id().unwrap_or(0);
        let mut server = ServerSsm::new(peer(), invoke_id);
        server.on_network_pdu(&mut harness.context(), request).unwrap();
        assert_eq!(server.state(), TransactionState::AwaitResponse);
        server
    }

    #[test]
    fn test_request_delivered_and_answered() {
        let mut harness = Harness::default();
        let request = confirmed_request(4, vec![1, 2]);
        let mut server = awaiting_response(&mut harness, request.clone());
        assert_eq!(harness.application.indications, vec![(request, peer())]);
        assert!(server.segmented_response_accepted());

        server
            .on_response(
                &mut harness.context(),
                Apdu::SimpleAck {
                    invoke_id: 0,
                    service_choice: 15,
                },
            )
            .unwrap();
        assert_eq!(server.state(), TransactionState::Completed);
        assert_eq!(
            harness.take_sent(),
            vec![Apdu::SimpleAck {
                invoke_id: 4,
                service_choice: 15,
            }]
        );
        assert!(harness.scheduler.is_empty());
    }

    #[test]
    fn test_duplicate_request_ignored() {
        let mut harness = Harness::default();
        let request = confirmed_request(4, vec![1, 2]);
        let mut server = awaiting_response(&mut harness, request.clone());
        server.on_network_pdu(&mut harness.context(), request).unwrap();
        assert_eq!(server.state(), TransactionState::AwaitResponse);
        assert_eq!(harness.application.indications.len(), 1);
    }

    #[test]
    fn test_response_only_in_await_response() {
        let mut harness = Harness::default();
        let mut server = ServerSsm::new(peer(), 1);
        assert_eq!(
            server.on_response(&mut harness.context(), complex_ack(1, vec![])),
            Err(TransactionError::UnexpectedApdu {
                kind: crate::app::ApduType::ComplexAck,
                state: TransactionState::Idle,
            })
        );
    }

    #[test]
    fn test_segmented_request_reassembled() {
        let mut harness = Harness::default();
        let mut server = ServerSsm::new(peer(), 11);
        let mut ctx = harness.context();

        server
            .on_network_pdu(&mut ctx, request_segment(11, 0, true, vec![1]))
            .unwrap();
        assert_eq!(server.state(), TransactionState::SegmentedRequest);
        assert_eq!(server.ssm().actual_window_size(), 4);
        server
            .on_network_pdu(&mut ctx, request_segment(11, 1, true, vec![2]))
            .unwrap();
        server
            .on_network_pdu(&mut ctx, request_segment(11, 2, false, vec![3]))
            .unwrap();
        drop(ctx);

        assert_eq!(server.state(), TransactionState::AwaitResponse);
        let (request, _) = &harness.application.indications[0];
        assert!(!request.is_segmented());
        assert_eq!(request.service_data(), &[1, 2, 3]);

        let acks = harness.take_sent();
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(Apdu::is_server));
    }

    #[test]
    fn test_segmented_request_refused() {
        let mut harness = Harness::default();
        harness.config.segmentation = Segmentation::Transmit;
        let mut server = ServerSsm::new(peer(), 12);

        server
            .on_network_pdu(&mut harness.context(), request_segment(12, 0, true, vec![1]))
            .unwrap();
        assert_eq!(server.state(), TransactionState::Aborted);
        assert_eq!(
            harness.take_sent(),
            vec![Apdu::Abort {
                server: true,
                invoke_id: 12,
                abort_reason: AbortReason::SegmentationNotSupported.into(),
            }]
        );
        assert!(harness.application.indications.is_empty());
    }

    #[test]
    fn test_segmented_response_windows() {
        let mut harness = Harness::default();
        let mut request = request_segment(13, 0, false, vec![]);
        if let Apdu::ConfirmedRequest {
            segmented,
            sequence_number,
            proposed_window_size,
            ..
        } = &mut request
        {
            *segmented = false;
            *sequence_number = None;
            *proposed_window_size = None;
        }
        let mut server = awaiting_response(&mut harness, request);

        server
            .on_response(&mut harness.context(), complex_ack(13, vec![0; 1200]))
            .unwrap();
        assert_eq!(server.state(), TransactionState::SegmentedResponse);
        // limited by the requester's max-response size
        assert_eq!(server.ssm().segment_size(), 480);
        assert_eq!(server.ssm().segment_count(), 3);
        assert_eq!(harness.take_sent().len(), 1);

        let ack = |sequence_number| Apdu::SegmentAck {
            negative: false,
            server: false,
            invoke_id: 13,
            sequence_number,
            window_size: 4,
        };
        server.on_network_pdu(&mut harness.context(), ack(0)).unwrap();
        assert_eq!(harness.take_sent().len(), 2);
        assert!(server.ssm().sent_all_segments());
        server.on_network_pdu(&mut harness.context(), ack(2)).unwrap();
        assert_eq!(server.state(), TransactionState::Completed);
    }

    #[test]
    fn test_segmented_response_not_accepted() {
        let mut harness = Harness::default();
        let mut request = confirmed_request(14, vec![]);
        if let Apdu::ConfirmedRequest {
            segmented_response_accepted,
            ..
        } = &mut request
        {
            *segmented_response_accepted = false;
        }
        let mut server = awaiting_response(&mut harness, request);

        server
            .on_response(&mut harness.context(), complex_ack(14, vec![0; 3000]))
            .unwrap();
        assert_eq!(server.state(), TransactionState::Aborted);
        let expected = Apdu::Abort {
            server: true,
            invoke_id: 14,
            abort_reason: AbortReason::SegmentationNotSupported.into(),
        };
        assert_eq!(harness.take_sent(), vec![expected.clone()]);
        assert_eq!(harness.application.indications[1].0, expected);
    }

    #[test]
    fn test_application_timeout() {
        let mut harness = Harness::default();
        let mut server = awaiting_response(&mut harness, confirmed_request(15, vec![]));
        server.on_timeout(&mut harness.context()).unwrap();

        assert_eq!(server.state(), TransactionState::Aborted);
        assert_eq!(
            harness.take_sent(),
            vec![Apdu::Abort {
                server: true,
                invoke_id: 15,
                abort_reason: AbortReason::ServerTimeout.into(),
            }]
        );
        assert_eq!(harness.application.indications.len(), 1);
    }

    #[test]
    fn test_client_abort_while_awaiting_response() {
        let mut harness = Harness::default();
        let mut server = awaiting_response(&mut harness, confirmed_request(16, vec![]));
        let abort = Apdu::Abort {
            server: false,
            invoke_id: 16,
            abort_reason: AbortReason::Other.into(),
        };
        server.on_network_pdu(&mut harness.context(), abort.clone()).unwrap();
        assert_eq!(server.state(), TransactionState::Aborted);
        assert_eq!(harness.application.indications[1].0, abort);
        assert!(harness.take_sent().is_empty());
    }

    #[test]
    fn test_client_abort_during_segmented_request() {
        let mut harness = Harness::default();
        let mut server = ServerSsm::new(peer(), 17);
        server
            .on_network_pdu(&mut harness.context(), request_segment(17, 0, true, vec![1]))
            .unwrap();
        server
            .on_network_pdu(
                &mut harness.context(),
                Apdu::Abort {
                    server: false,
                    invoke_id: 17,
                    abort_reason: 0,
                },
            )
            .unwrap();
        assert_eq!(server.state(), TransactionState::Completed);
        assert!(harness.application.indications.is_empty());
    }

    #[test]
    fn test_application_abort_completes() {
        let mut harness = Harness::default();
        let mut server = awaiting_response(&mut harness, confirmed_request(18, vec![]));
        server
            .on_response(
                &mut harness.context(),
                Apdu::Abort {
                    server: false,
                    invoke_id: 0,
                    abort_reason: AbortReason::OutOfResources.into(),
                },
            )
            .unwrap();
        assert_eq!(server.state(), TransactionState::Completed);
        assert_eq!(
            harness.take_sent(),
            vec![Apdu::Abort {
                server: true,
                invoke_id: 18,
                abort_reason: AbortReason::OutOfResources.into(),
            }]
        );
        assert_eq!(harness.application.indications.len(), 1);
    }
}
