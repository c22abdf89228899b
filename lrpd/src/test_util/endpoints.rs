//! Scripted endpoints: replay a fixed sequence of events to the loop.

use crate::address::Address;
use crate::endpoints::{Channel, DivertedPacket, Endpoints, Ready, Transmit};
use smoltcp::wire::EthernetAddress;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

/// Longest sleep of an idle `wait` without timers.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// One scripted event.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Nothing ready: `wait` sleeps through its timeout.
    Idle,
    Datagram {
        channel: Channel,
        payload: Vec<u8>,
        sender: Address,
    },
    /// A queued packet, parsed like the real queue payload.
    Diverted {
        payload: Vec<u8>,
        sender_link: Option<EthernetAddress>,
    },
    Shutdown,
}

#[derive(Debug, Default)]
struct EndpointsState {
    script: VecDeque<Scripted>,
    datagram: Option<(Vec<u8>, Address)>,
    diverted: Option<(Vec<u8>, Option<EthernetAddress>)>,
    held: bool,
    released: usize,
    sent: Vec<(Vec<u8>, Option<Address>)>,
}

/// Fake endpoints. An exhausted script behaves as `Idle`.
///
/// Clones share state, so a test can inspect what was sent and released
/// after handing one clone to the event loop.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEndpoints {
    state: Rc<RefCell<EndpointsState>>,
}

impl ScriptedEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Scripted) -> &Self {
        self.state.borrow_mut().script.push_back(event);
        self
    }

    pub fn push_datagram(&self, channel: Channel, payload: &[u8], sender: Address) -> &Self {
        self.push(Scripted::Datagram {
            channel,
            payload: payload.to_vec(),
            sender,
        })
    }

    pub fn push_diverted(&self, payload: Vec<u8>, sender_link: Option<EthernetAddress>) -> &Self {
        self.push(Scripted::Diverted {
            payload,
            sender_link,
        })
    }

    /// Events not consumed yet.
    pub fn remaining(&self) -> usize {
        self.state.borrow().script.len()
    }

    /// Diverted packets given a verdict.
    pub fn released(&self) -> usize {
        self.state.borrow().released
    }

    /// Datagrams transmitted, with their destination (`None`: multicast).
    pub fn sent(&self) -> Vec<(Vec<u8>, Option<Address>)> {
        self.state.borrow().sent.clone()
    }
}

impl Transmit for ScriptedEndpoints {
    fn transmit(&mut self, payload: &[u8], destination: Option<Address>) -> io::Result<()> {
        self.state
            .borrow_mut()
            .sent
            .push((payload.to_vec(), destination));
        Ok(())
    }
}

impl Endpoints for ScriptedEndpoints {
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Option<Ready>> {
        let event = self.state.borrow_mut().script.pop_front();
        let mut state = self.state.borrow_mut();
        match event.unwrap_or(Scripted::Idle) {
            Scripted::Idle => {
                drop(state);
                std::thread::sleep(timeout.unwrap_or(IDLE_WAIT));
                Ok(None)
            }
            Scripted::Datagram {
                channel,
                payload,
                sender,
            } => {
                state.datagram = Some((payload, sender));
                Ok(Some(Ready::Datagram(channel)))
            }
            Scripted::Diverted {
                payload,
                sender_link,
            } => {
                state.diverted = Some((payload, sender_link));
                Ok(Some(Ready::Diversion))
            }
            Scripted::Shutdown => Ok(Some(Ready::Shutdown)),
        }
    }

    fn recv_datagram(&mut self, _channel: Channel) -> io::Result<(Vec<u8>, Address)> {
        self.state
            .borrow_mut()
            .datagram
            .take()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))
    }

    fn next_diverted(&mut self) -> io::Result<Option<DivertedPacket>> {
        let mut state = self.state.borrow_mut();
        let Some((payload, sender_link)) = state.diverted.take() else {
            return Ok(None);
        };
        state.held = true;
        Ok(DivertedPacket::parse(&payload, sender_link))
    }

    fn release_diverted(&mut self) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.held {
            state.held = false;
            state.released += 1;
        }
        Ok(())
    }
}
