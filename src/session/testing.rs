//! In-crate doubles for the dialog layer, the registry and the relay sockets.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rsip::{Headers, Method};

use crate::config::{
    B2bConfig, BindConfig, MediaConfig, PortRange, RefreshMethod, SessionConfig,
};
use crate::error::{Error, Result};
use crate::media::{RelayTransport, StreamHandle};
use crate::sip::{
    Dialog, DialogFactory, DialogSetup, DialogStatus, MessageBody, SipRequest, TransactionRecord,
};

use super::context::SessionContext;
use super::event::LegEvent;
use super::leg::Leg;
use super::registry::Registry;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub enum DialogAction {
    Request {
        method: Method,
        cseq: u32,
        body: MessageBody,
        headers: Headers,
    },
    Reply {
        request_cseq: u32,
        method: Method,
        code: u16,
        reason: String,
        body: MessageBody,
        headers: Headers,
    },
    FinalAck {
        cseq: u32,
        peer_cseq: u32,
        body: MessageBody,
    },
    Bye,
    Refresh(RefreshMethod),
}

impl DialogAction {
    pub fn is_bye(&self) -> bool {
        matches!(self, DialogAction::Bye)
    }
}

#[derive(Debug)]
struct DialogState {
    remote_party: String,
    remote_uri: String,
    status: DialogStatus,
    next_cseq: u32,
    invite_pending: bool,
    fail_requests: bool,
    actions: Vec<DialogAction>,
}

/// Test-side view of a [`FakeDialog`] that was moved into a leg.
#[derive(Debug, Clone)]
pub struct DialogHandle {
    state: Arc<Mutex<DialogState>>,
}

impl DialogHandle {
    pub fn set_status(&self, status: DialogStatus) {
        lock(&self.state).status = status;
    }

    pub fn set_next_cseq(&self, cseq: u32) {
        lock(&self.state).next_cseq = cseq;
    }

    pub fn set_invite_pending(&self, pending: bool) {
        lock(&self.state).invite_pending = pending;
    }

    /// Makes every following `send_request` fail.
    pub fn fail_requests(&self, fail: bool) {
        lock(&self.state).fail_requests = fail;
    }

    pub fn actions(&self) -> Vec<DialogAction> {
        lock(&self.state).actions.clone()
    }

    /// Sent requests as (method, body, headers).
    pub fn requests(&self) -> Vec<(Method, MessageBody, Headers)> {
        lock(&self.state)
            .actions
            .iter()
            .filter_map(|action| match action {
                DialogAction::Request {
                    method,
                    body,
                    headers,
                    ..
                } => Some((*method, body.clone(), headers.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn remote_party(&self) -> String {
        lock(&self.state).remote_party.clone()
    }

    pub fn remote_uri(&self) -> String {
        lock(&self.state).remote_uri.clone()
    }
}

/// Dialog that records what the engine asks it to send.
#[derive(Debug)]
pub struct FakeDialog {
    local_tag: String,
    local_party: String,
    local_uri: String,
    remote_party: String,
    remote_uri: String,
    state: Arc<Mutex<DialogState>>,
}

impl FakeDialog {
    /// Caller side dialog between alice and bob.
    pub fn new(local_tag: &str) -> (Self, DialogHandle) {
        Self::from_setup(DialogSetup {
            local_tag: local_tag.to_string(),
            call_id: format!("{local_tag}-call"),
            local_party: "<sip:alice@example.org>".into(),
            remote_party: "<sip:bob@example.org>".into(),
            remote_uri: "sip:bob@example.org".into(),
        })
    }

    pub fn from_setup(setup: DialogSetup) -> (Self, DialogHandle) {
        let local_uri = setup
            .local_party
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string();
        let state = Arc::new(Mutex::new(DialogState {
            remote_party: setup.remote_party.clone(),
            remote_uri: setup.remote_uri.clone(),
            status: DialogStatus::Disconnected,
            next_cseq: 1,
            invite_pending: false,
            fail_requests: false,
            actions: Vec::new(),
        }));
        let dialog = Self {
            local_tag: setup.local_tag,
            local_party: setup.local_party,
            local_uri,
            remote_party: setup.remote_party,
            remote_uri: setup.remote_uri,
            state: state.clone(),
        };
        (dialog, DialogHandle { state })
    }
}

#[async_trait]
impl Dialog for FakeDialog {
    fn local_tag(&self) -> &str {
        &self.local_tag
    }

    fn local_party(&self) -> &str {
        &self.local_party
    }

    fn remote_party(&self) -> &str {
        &self.remote_party
    }

    fn local_uri(&self) -> &str {
        &self.local_uri
    }

    fn remote_uri(&self) -> &str {
        &self.remote_uri
    }

    fn set_remote_party(&mut self, party: String) {
        lock(&self.state).remote_party = party.clone();
        self.remote_party = party;
    }

    fn set_remote_uri(&mut self, uri: String) {
        lock(&self.state).remote_uri = uri.clone();
        self.remote_uri = uri;
    }

    fn status(&self) -> DialogStatus {
        lock(&self.state).status
    }

    fn next_cseq(&self) -> u32 {
        lock(&self.state).next_cseq
    }

    fn uac_invite_pending(&self) -> bool {
        lock(&self.state).invite_pending
    }

    async fn send_request(
        &mut self,
        method: Method,
        body: &MessageBody,
        headers: &Headers,
    ) -> Result<u32> {
        let mut state = lock(&self.state);
        if state.fail_requests {
            return Err(Error::dialog(format!("{method} rejected by test dialog")));
        }
        let cseq = state.next_cseq;
        state.next_cseq += 1;
        if method == Method::Invite {
            state.invite_pending = true;
            if state.status == DialogStatus::Disconnected {
                state.status = DialogStatus::Early;
            }
        }
        state.actions.push(DialogAction::Request {
            method,
            cseq,
            body: body.clone(),
            headers: headers.clone(),
        });
        Ok(cseq)
    }

    async fn reply(
        &mut self,
        request: &SipRequest,
        code: u16,
        reason: &str,
        body: &MessageBody,
        headers: &Headers,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        match request.method {
            Method::Invite if (200..300).contains(&code) => state.status = DialogStatus::Connected,
            Method::Invite if code >= 300 => state.status = DialogStatus::Disconnected,
            Method::Bye if code >= 200 => state.status = DialogStatus::Disconnected,
            _ => {}
        }
        state.actions.push(DialogAction::Reply {
            request_cseq: request.cseq,
            method: request.method,
            code,
            reason: reason.to_string(),
            body: body.clone(),
            headers: headers.clone(),
        });
        Ok(())
    }

    async fn send_final_ack(
        &mut self,
        transaction: &TransactionRecord,
        cseq: u32,
        body: &MessageBody,
        _headers: &Headers,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        state.invite_pending = false;
        state.status = DialogStatus::Connected;
        state.actions.push(DialogAction::FinalAck {
            cseq,
            peer_cseq: transaction.peer_cseq,
            body: body.clone(),
        });
        Ok(())
    }

    async fn bye(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.invite_pending = false;
        state.status = DialogStatus::Disconnected;
        state.actions.push(DialogAction::Bye);
        Ok(())
    }

    async fn refresh(&mut self, method: RefreshMethod) -> Result<()> {
        lock(&self.state).actions.push(DialogAction::Refresh(method));
        Ok(())
    }
}

/// Creates [`FakeDialog`]s and keeps their handles by local tag.
#[derive(Debug, Default)]
pub struct FakeDialogFactory {
    created: Mutex<Vec<(DialogSetup, DialogHandle)>>,
}

impl FakeDialogFactory {
    pub fn setups(&self) -> Vec<DialogSetup> {
        lock(&self.created)
            .iter()
            .map(|(setup, _)| setup.clone())
            .collect()
    }

    pub fn handle(&self, local_tag: &str) -> Option<DialogHandle> {
        lock(&self.created)
            .iter()
            .find(|(setup, _)| setup.local_tag == local_tag)
            .map(|(_, handle)| handle.clone())
    }
}

impl DialogFactory for FakeDialogFactory {
    fn create_dialog(&self, setup: DialogSetup) -> Box<dyn Dialog> {
        let (dialog, handle) = FakeDialog::from_setup(setup.clone());
        lock(&self.created).push((setup, handle));
        Box::new(dialog)
    }
}

/// Registry that records posted events instead of delivering them.
#[derive(Default)]
pub struct RecordingRegistry {
    counter: AtomicU64,
    posted: Mutex<Vec<(String, LegEvent)>>,
    sessions: Mutex<Vec<Leg>>,
    gone: Mutex<HashSet<String>>,
}

impl RecordingRegistry {
    pub fn take_posted(&self) -> Vec<(String, LegEvent)> {
        std::mem::take(&mut *lock(&self.posted))
    }

    /// Hands out a leg added through [`Registry::add_session`].
    pub fn take_session(&self, local_tag: &str) -> Option<Leg> {
        let mut sessions = lock(&self.sessions);
        let index = sessions
            .iter()
            .position(|leg| leg.local_tag() == local_tag)?;
        Some(sessions.remove(index))
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Posts to `local_tag` fail from now on.
    pub fn mark_gone(&self, local_tag: &str) {
        lock(&self.gone).insert(local_tag.to_string());
    }
}

impl Registry for RecordingRegistry {
    fn post_event(&self, target: &str, event: LegEvent) -> Result<()> {
        if lock(&self.gone).contains(target) {
            return Err(Error::PeerGone(target.to_string()));
        }
        lock(&self.posted).push((target.to_string(), event));
        Ok(())
    }

    fn add_session(&self, leg: Leg) -> Result<()> {
        lock(&self.sessions).push(leg);
        Ok(())
    }

    fn new_id(&self) -> String {
        format!("leg-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn sessions(&self) -> Vec<String> {
        lock(&self.sessions)
            .iter()
            .map(|leg| leg.local_tag().to_string())
            .collect()
    }
}

#[derive(Debug, Default)]
struct RelayState {
    next_port: u16,
    next_handle: u64,
    bound: HashMap<StreamHandle, u16>,
    links: Vec<(StreamHandle, StreamHandle)>,
    remotes: Vec<(StreamHandle, SocketAddr)>,
    released: Vec<StreamHandle>,
}

/// Relay transport handing out sequential even ports without sockets.
#[derive(Debug)]
pub struct FakeRelayTransport {
    state: Mutex<RelayState>,
}

impl FakeRelayTransport {
    pub fn new(start_port: u16) -> Self {
        Self {
            state: Mutex::new(RelayState {
                next_port: start_port,
                next_handle: 1,
                ..RelayState::default()
            }),
        }
    }

    pub fn links(&self) -> Vec<(StreamHandle, StreamHandle)> {
        lock(&self.state).links.clone()
    }

    /// Every `set_remote` call in order.
    pub fn remotes(&self) -> Vec<(StreamHandle, SocketAddr)> {
        lock(&self.state).remotes.clone()
    }

    pub fn remote_of(&self, stream: StreamHandle) -> Option<SocketAddr> {
        lock(&self.state)
            .remotes
            .iter()
            .rev()
            .find(|(handle, _)| *handle == stream)
            .map(|(_, remote)| *remote)
    }

    pub fn released(&self) -> Vec<StreamHandle> {
        lock(&self.state).released.clone()
    }
}

impl RelayTransport for FakeRelayTransport {
    fn bind(&self, _local: IpAddr) -> Result<StreamHandle> {
        let mut state = lock(&self.state);
        let handle = StreamHandle(state.next_handle);
        state.next_handle += 1;
        let port = state.next_port;
        state.next_port += 2;
        state.bound.insert(handle, port);
        Ok(handle)
    }

    fn local_port(&self, stream: StreamHandle) -> Result<u16> {
        lock(&self.state)
            .bound
            .get(&stream)
            .copied()
            .ok_or_else(|| Error::Media(format!("{stream} is not bound")))
    }

    fn set_remote(&self, stream: StreamHandle, remote: SocketAddr) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.bound.contains_key(&stream) {
            return Err(Error::Media(format!("{stream} is not bound")));
        }
        state.remotes.push((stream, remote));
        Ok(())
    }

    fn link(&self, a: StreamHandle, b: StreamHandle) -> Result<()> {
        lock(&self.state).links.push((a, b));
        Ok(())
    }

    fn release(&self, stream: StreamHandle) {
        let mut state = lock(&self.state);
        if state.bound.remove(&stream).is_some() {
            state.released.push(stream);
        }
    }
}

pub struct TestFakes {
    pub context: SessionContext,
    pub dialogs: Arc<FakeDialogFactory>,
    pub relay: Arc<FakeRelayTransport>,
}

pub fn test_config(rtp_relay: bool) -> B2bConfig {
    B2bConfig {
        media: MediaConfig {
            bind: BindConfig {
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                interface: None,
            },
            advertised_address: Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5))),
            port_range: PortRange {
                min: 20000,
                max: 20998,
            },
            max_relay_streams: 3,
        },
        session: SessionConfig {
            rtp_relay,
            ..SessionConfig::default()
        },
    }
}

pub fn test_context_with(registry: Arc<dyn Registry>, rtp_relay: bool) -> TestFakes {
    fakes_for(registry, test_config(rtp_relay))
}

pub fn test_context(rtp_relay: bool) -> (TestFakes, Arc<RecordingRegistry>) {
    test_context_from(test_config(rtp_relay))
}

pub fn test_context_from(config: B2bConfig) -> (TestFakes, Arc<RecordingRegistry>) {
    let registry = Arc::new(RecordingRegistry::default());
    (fakes_for(registry.clone(), config), registry)
}

fn fakes_for(registry: Arc<dyn Registry>, config: B2bConfig) -> TestFakes {
    let dialogs = Arc::new(FakeDialogFactory::default());
    let relay = Arc::new(FakeRelayTransport::new(config.media.port_range.min));
    let context = SessionContext {
        config: Arc::new(config),
        registry,
        relay: relay.clone(),
        dialogs: dialogs.clone(),
    };
    TestFakes {
        context,
        dialogs,
        relay,
    }
}

/// Delivers recorded events to `legs` until no more are posted. Events for
/// legs not in `legs` are dropped.
pub async fn pump(registry: &RecordingRegistry, legs: &mut [&mut Leg]) {
    loop {
        let posted = registry.take_posted();
        if posted.is_empty() {
            break;
        }
        for (target, event) in posted {
            if let Some(leg) = legs.iter_mut().find(|leg| leg.local_tag() == target) {
                leg.process(event).await;
            }
        }
    }
}
