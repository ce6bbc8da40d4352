// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Scriptable in-memory [`Transport`] for unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};

use crate::error::HostError;
use crate::protocol::GET_DESCRIPTOR;
use crate::transport::{
    ConfigurationInfo, ControlIn, ControlSetup, DisconnectSubscription, Transport,
    TransferStatus,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Open,
    Close,
    SelectConfiguration(u8),
    ClaimInterface(u8),
    SelectAlternate(u8, u8),
    In(ControlSetup, u16),
    Out(ControlSetup, Vec<u8>),
    Subscribe,
}

/// Fires the disconnect event at whichever listener is registered.
#[derive(Debug, Clone, Default)]
pub(crate) struct DisconnectTrigger {
    listener: Arc<Mutex<Option<Sender<()>>>>,
}

impl DisconnectTrigger {
    /// Returns whether a listener received the event.
    pub(crate) fn fire(&self) -> bool {
        match self.listener.lock().unwrap().as_ref() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    pub configurations: Vec<ConfigurationInfo>,
    pub active_configuration: Option<u8>,
    pub claimed: BTreeSet<u8>,
    pub alternates: BTreeMap<u8, u8>,
    /// Control IN responses keyed by (bRequest, wValue, wIndex).
    pub responses: BTreeMap<(u8, u16, u16), Result<Vec<u8>, TransferStatus>>,
    pub out_status: Option<TransferStatus>,
    /// Error returned by the next alternate selection.
    pub alternate_error: Option<HostError>,
    pub close_error: Option<HostError>,
    pub calls: Vec<Call>,
    pub disconnect: DisconnectTrigger,
}

impl MockTransport {
    pub(crate) fn new(configurations: Vec<ConfigurationInfo>) -> Self {
        MockTransport {
            configurations,
            ..Default::default()
        }
    }

    /// Scripts the answer to a GET_DESCRIPTOR.
    pub(crate) fn respond(&mut self, value: u16, index: u16, data: &[u8]) {
        self.respond_to(GET_DESCRIPTOR, value, index, data);
    }

    pub(crate) fn respond_to(&mut self, request: u8, value: u16, index: u16, data: &[u8]) {
        self.responses.insert((request, value, index), Ok(data.to_vec()));
    }

    /// Scripts a GET_DESCRIPTOR that completes with `status` and no data.
    pub(crate) fn fail(&mut self, value: u16, index: u16, status: TransferStatus) {
        self.responses.insert((GET_DESCRIPTOR, value, index), Err(status));
    }

    pub(crate) fn control_ins(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::In(..)))
            .count()
    }

    /// Calls that change device state, as opposed to transfers.
    pub(crate) fn selections(&self) -> Vec<Call> {
        self.calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::SelectConfiguration(_)
                        | Call::ClaimInterface(_)
                        | Call::SelectAlternate(..)
                )
            })
            .cloned()
            .collect()
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), HostError> {
        self.calls.push(Call::Open);
        Ok(())
    }

    fn close(&mut self) -> Result<(), HostError> {
        self.calls.push(Call::Close);
        match self.close_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn configurations(&self) -> &[ConfigurationInfo] {
        &self.configurations
    }

    fn active_configuration(&self) -> Option<u8> {
        self.active_configuration
    }

    fn select_configuration(&mut self, value: u8) -> Result<(), HostError> {
        self.calls.push(Call::SelectConfiguration(value));
        self.active_configuration = Some(value);
        Ok(())
    }

    fn is_claimed(&self, interface: u8) -> bool {
        self.claimed.contains(&interface)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), HostError> {
        self.calls.push(Call::ClaimInterface(interface));
        self.claimed.insert(interface);
        Ok(())
    }

    fn current_alternate(&self, interface: u8) -> Option<u8> {
        self.alternates.get(&interface).copied()
    }

    fn select_alternate_interface(
        &mut self,
        interface: u8,
        alternate: u8,
    ) -> Result<(), HostError> {
        self.calls.push(Call::SelectAlternate(interface, alternate));
        if let Some(e) = self.alternate_error.take() {
            return Err(e);
        }
        self.alternates.insert(interface, alternate);
        Ok(())
    }

    fn control_transfer_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
    ) -> Result<ControlIn, HostError> {
        self.calls.push(Call::In(setup, length));
        match self.responses.get(&(setup.request, setup.value, setup.index)) {
            Some(Ok(data)) => {
                let n = data.len().min(usize::from(length));
                Ok(ControlIn {
                    status: TransferStatus::Ok,
                    data: data[..n].to_vec(),
                })
            }
            Some(Err(status)) => Ok(ControlIn {
                status: *status,
                data: Vec::new(),
            }),
            None => Ok(ControlIn {
                status: TransferStatus::Stall,
                data: Vec::new(),
            }),
        }
    }

    fn control_transfer_out(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<TransferStatus, HostError> {
        self.calls.push(Call::Out(setup, data.to_vec()));
        Ok(self.out_status.unwrap_or(TransferStatus::Ok))
    }

    fn subscribe_disconnect(&mut self) -> Result<DisconnectSubscription, HostError> {
        self.calls.push(Call::Subscribe);
        let (tx, rx) = channel();
        *self.disconnect.listener.lock().unwrap() = Some(tx);
        let listener = self.disconnect.listener.clone();
        Ok(DisconnectSubscription::new(rx, move || {
            *listener.lock().unwrap() = None;
        }))
    }
}
