use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use b2b_sip::config::{
    B2bConfig, BindConfig, BodyModeConfig, DEFAULT_MAX_RELAY_STREAMS, MediaConfig, PortRange,
    RefreshMethod, SessionConfig,
};
use b2b_sip::sip::{
    Dialog, DialogFactory, DialogSetup, DialogStatus, MessageBody, SipReply, SipRequest,
    TransactionRecord,
};
use b2b_sip::{B2bEngine, CalleeTarget, LegEvent};
use clap::Parser;
use rsip::{Headers, Method};
use tokio::sync::mpsc;
use tracing::info;
#[cfg(not(feature = "telemetry"))]
use tracing::warn;

const CALLER_OFFER: &str = "v=0\r\no=alice 1 1 IN IP4 198.51.100.10\r\ns=-\r\nc=IN IP4 198.51.100.10\r\nt=0 0\r\nm=audio 49170 RTP/AVP 0\r\nm=video 49172 RTP/AVP 96\r\n";
const CALLEE_ANSWER: &str = "v=0\r\no=bob 1 1 IN IP4 198.51.100.20\r\ns=-\r\nc=IN IP4 198.51.100.20\r\nt=0 0\r\nm=audio 51372 RTP/AVP 0\r\nm=video 0 RTP/AVP 96\r\n";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "b2b-sip-demo",
    about = "Runs one scripted call through the B2B session engine",
    version
)]
struct Cli {
    /// Address the RTP relay binds and advertises
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    media_addr: IpAddr,

    /// Optional network interface name for SO_BINDTODEVICE on relay sockets
    #[arg(long)]
    media_interface: Option<String>,

    /// Lower bound (inclusive) for RTP relay port allocation (must be even)
    #[arg(long, default_value_t = 40000)]
    media_port_min: u16,

    /// Upper bound (inclusive) for RTP relay port allocation
    #[arg(long, default_value_t = 40100)]
    media_port_max: u16,

    /// Relay RTP through local sockets and rewrite SDP accordingly
    #[arg(long)]
    rtp_relay: bool,

    /// Media kind disabled in relayed SDP (repeatable)
    #[arg(long = "filter-media", value_name = "KIND", action = clap::ArgAction::Append)]
    filter_media: Vec<String>,

    /// Log level when telemetry feature is enabled (default info)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Result<B2bConfig> {
        if self.media_port_min % 2 != 0 {
            return Err(anyhow!("media-port-min must be an even port"));
        }

        let body_mode = if self.filter_media.is_empty() {
            BodyModeConfig::Transparent
        } else {
            BodyModeConfig::SdpFilter
        };

        Ok(B2bConfig {
            media: MediaConfig {
                bind: BindConfig {
                    address: self.media_addr,
                    interface: self.media_interface,
                },
                advertised_address: None,
                port_range: PortRange {
                    min: self.media_port_min,
                    max: self.media_port_max,
                },
                max_relay_streams: DEFAULT_MAX_RELAY_STREAMS,
            },
            session: SessionConfig {
                relay_only: false,
                rtp_relay: self.rtp_relay,
                relay_early_media_sdp: false,
                body_mode,
                filtered_media: self.filter_media,
                refresh_method: RefreshMethod::Invite,
            },
        })
    }
}

/// What a loopback dialog was asked to put on the wire.
#[derive(Debug)]
struct Sent {
    local_tag: String,
    method: Method,
    cseq: u32,
}

/// Dialog with no transport: sends are logged and reported to the script.
struct LoopbackDialog {
    setup: DialogSetup,
    local_uri: String,
    status: DialogStatus,
    next_cseq: u32,
    invite_pending: bool,
    sent: mpsc::UnboundedSender<Sent>,
}

impl LoopbackDialog {
    fn new(setup: DialogSetup, sent: mpsc::UnboundedSender<Sent>) -> Self {
        let local_uri = setup
            .local_party
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string();
        Self {
            setup,
            local_uri,
            status: DialogStatus::Disconnected,
            next_cseq: 1,
            invite_pending: false,
            sent,
        }
    }
}

#[async_trait]
impl Dialog for LoopbackDialog {
    fn local_tag(&self) -> &str {
        &self.setup.local_tag
    }

    fn local_party(&self) -> &str {
        &self.setup.local_party
    }

    fn remote_party(&self) -> &str {
        &self.setup.remote_party
    }

    fn local_uri(&self) -> &str {
        &self.local_uri
    }

    fn remote_uri(&self) -> &str {
        &self.setup.remote_uri
    }

    fn set_remote_party(&mut self, party: String) {
        self.setup.remote_party = party;
    }

    fn set_remote_uri(&mut self, uri: String) {
        self.setup.remote_uri = uri;
    }

    fn status(&self) -> DialogStatus {
        self.status
    }

    fn next_cseq(&self) -> u32 {
        self.next_cseq
    }

    fn uac_invite_pending(&self) -> bool {
        self.invite_pending
    }

    async fn send_request(
        &mut self,
        method: Method,
        body: &MessageBody,
        _headers: &Headers,
    ) -> b2b_sip::Result<u32> {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        match method {
            Method::Invite => {
                self.invite_pending = true;
                if self.status == DialogStatus::Disconnected {
                    self.status = DialogStatus::Early;
                }
            }
            Method::Bye => self.status = DialogStatus::Disconnected,
            _ => {}
        }
        info!(local_tag = %self.setup.local_tag, %method, cseq, body = %body.data, "request out");
        let _ = self.sent.send(Sent {
            local_tag: self.setup.local_tag.clone(),
            method,
            cseq,
        });
        Ok(cseq)
    }

    async fn reply(
        &mut self,
        request: &SipRequest,
        code: u16,
        reason: &str,
        body: &MessageBody,
        _headers: &Headers,
    ) -> b2b_sip::Result<()> {
        match request.method {
            Method::Invite if (200..300).contains(&code) => self.status = DialogStatus::Connected,
            Method::Invite if code >= 300 => self.status = DialogStatus::Disconnected,
            Method::Bye if code >= 200 => self.status = DialogStatus::Disconnected,
            _ => {}
        }
        info!(
            local_tag = %self.setup.local_tag,
            method = %request.method,
            cseq = request.cseq,
            code,
            reason,
            body = %body.data,
            "reply out"
        );
        Ok(())
    }

    async fn send_final_ack(
        &mut self,
        transaction: &TransactionRecord,
        cseq: u32,
        _body: &MessageBody,
        _headers: &Headers,
    ) -> b2b_sip::Result<()> {
        self.invite_pending = false;
        self.status = DialogStatus::Connected;
        info!(local_tag = %self.setup.local_tag, cseq, peer_cseq = transaction.peer_cseq, "ACK out");
        Ok(())
    }

    async fn bye(&mut self) -> b2b_sip::Result<()> {
        self.invite_pending = false;
        self.status = DialogStatus::Disconnected;
        info!(local_tag = %self.setup.local_tag, "BYE out");
        Ok(())
    }

    async fn refresh(&mut self, method: RefreshMethod) -> b2b_sip::Result<()> {
        info!(local_tag = %self.setup.local_tag, ?method, "session refresh");
        Ok(())
    }
}

struct LoopbackFactory {
    sent: mpsc::UnboundedSender<Sent>,
    created: Mutex<Vec<String>>,
}

impl DialogFactory for LoopbackFactory {
    fn create_dialog(&self, setup: DialogSetup) -> Box<dyn Dialog> {
        if let Ok(mut created) = self.created.lock() {
            created.push(setup.local_tag.clone());
        }
        Box::new(LoopbackDialog::new(setup, self.sent.clone()))
    }
}

fn sdp(data: &str) -> MessageBody {
    MessageBody::new("application/sdp", data)
}

async fn next_request(rx: &mut mpsc::UnboundedReceiver<Sent>, method: Method) -> Result<Sent> {
    loop {
        let sent = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .context("wait for outgoing request")?
            .ok_or_else(|| anyhow!("dialogs closed"))?;
        if sent.method == method {
            return Ok(sent);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let config = cli.into_config().context("build engine config")?;
    let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
    let factory = Arc::new(LoopbackFactory {
        sent: sent_tx.clone(),
        created: Mutex::new(Vec::new()),
    });

    let engine = B2bEngine::builder(config, factory.clone())
        .build()
        .context("initialise engine")?;

    let caller_tag = engine.registry().new_id();
    let caller_dialog = LoopbackDialog::new(
        DialogSetup {
            local_tag: caller_tag.clone(),
            call_id: engine.registry().new_id(),
            local_party: "<sip:gateway@example.org>".into(),
            remote_party: "<sip:alice@example.org>".into(),
            remote_uri: "sip:alice@198.51.100.10".into(),
        },
        sent_tx,
    );
    engine.start_caller(Box::new(caller_dialog))?;

    info!("caller sends INVITE");
    engine.post(
        &caller_tag,
        LegEvent::SipRequest(SipRequest::new(Method::Invite, 1).with_body(sdp(CALLER_OFFER))),
    )?;
    engine.post(
        &caller_tag,
        LegEvent::ConnectCallee(CalleeTarget {
            remote_party: "<sip:bob@example.org>".into(),
            remote_uri: "sip:bob@198.51.100.20".into(),
            relayed_invite: true,
        }),
    )?;

    let invite = next_request(&mut sent_rx, Method::Invite).await?;
    let callee_tag = invite.local_tag;
    info!(callee = %callee_tag, cseq = invite.cseq, "callee INVITE sent, answering");

    engine.post(
        &callee_tag,
        LegEvent::SipReply(SipReply::new(180, "Ringing", invite.cseq, Method::Invite)),
    )?;
    engine.post(
        &callee_tag,
        LegEvent::SipReply(
            SipReply::new(200, "OK", invite.cseq, Method::Invite).with_body(sdp(CALLEE_ANSWER)),
        ),
    )?;
    engine.post(
        &caller_tag,
        LegEvent::SipRequest(SipRequest::new(Method::Ack, 1)),
    )?;

    // let the answer reach the caller before hanging up
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("caller hangs up");
    engine.post(
        &caller_tag,
        LegEvent::SipRequest(SipRequest::new(Method::Bye, 2)),
    )?;

    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while !engine.registry().sessions().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if drained.is_err() {
        engine.shutdown();
        return Err(anyhow!(
            "legs still running: {:?}",
            engine.registry().sessions()
        ));
    }

    let created = factory.created.lock().map(|c| c.len()).unwrap_or_default();
    info!(callee_dialogs = created, "call finished");
    Ok(())
}

#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = if let Ok(value) = std::env::var(EnvFilter::DEFAULT_ENV) {
        EnvFilter::new(value)
    } else {
        EnvFilter::new(level)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
    Ok(())
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) -> Result<()> {
    if std::env::var("RUST_LOG").is_ok() {
        warn!("telemetry feature disabled; RUST_LOG ignored");
    }
    Ok(())
}
