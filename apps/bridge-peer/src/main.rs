use std::sync::Arc;

use anyhow::{Context, Result};
use bridge_proto::PeerClass;
use bridge_session::link::WebSocketConnector;
use bridge_session::{Session, SessionConfig, SessionUpdate};
use bridge_webrtc::{RtcConfig, WebRtcEngineFactory};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "bridge-peer",
    author,
    version,
    about = "Negotiate a peer-to-peer data channel through a bridge relay"
)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Relay websocket URL, without query parameters.
    #[arg(long, global = true)]
    url: Option<String>,

    /// Which side of the relay this endpoint registers on.
    #[arg(long, value_enum, global = true)]
    class: Option<ClassArg>,

    #[arg(long, global = true)]
    uid: Option<String>,

    #[arg(long, global = true)]
    token: Option<String>,

    /// Skip STUN and TURN servers; only host candidates are gathered.
    #[arg(long, global = true, default_value_t = false)]
    localhost: bool,

    /// Offer to receive the remote side's audio.
    #[arg(long, global = true, default_value_t = false)]
    receive_audio: bool,

    /// Offer to receive the remote side's video.
    #[arg(long, global = true, default_value_t = false)]
    receive_video: bool,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Mode {
    /// Create the data channel and send an offer.
    Offer,
    /// Wait for an offer and answer it; re-arms after the remote hangs up.
    Answer,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClassArg {
    Native,
    Web,
}

impl From<ClassArg> for PeerClass {
    fn from(value: ClassArg) -> Self {
        match value {
            ClassArg::Native => PeerClass::Native,
            ClassArg::Web => PeerClass::Web,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let cli = Cli::parse();
    let config = session_config(&cli)?;
    let mut rtc = RtcConfig::from_session(&config);
    if cli.localhost {
        rtc.ice_servers.clear();
    }
    rtc.receive_audio = cli.receive_audio;
    rtc.receive_video = cli.receive_video;

    let engines = WebRtcEngineFactory::new(rtc).context("failed to set up webrtc")?;
    let session = Session::new(config, Arc::new(WebSocketConnector), Arc::new(engines))?;
    info!(
        mode = ?cli.mode,
        class = %session.config().class,
        uid = %session.config().uid,
        url = %session.config().signaling_url,
        "starting bridge peer"
    );

    let updates = tokio::spawn(report_updates(session.clone(), cli.mode));
    arm(&session, cli.mode).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    if let Err(err) = session.send_message(line.trim_end()).await {
                        warn!(error = %err, "message not sent");
                    }
                }
                None => break,
            },
        }
    }

    session.hangup().await;
    updates.abort();
    info!("hung up");
    Ok(())
}

fn session_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = SessionConfig::from_env().context("invalid endpoint environment")?;
    if let Some(url) = &cli.url {
        config.signaling_url = url.clone();
    }
    if let Some(class) = cli.class {
        config.class = class.into();
    }
    if let Some(uid) = &cli.uid {
        config.uid = uid.clone();
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    Ok(config)
}

async fn arm(session: &Session, mode: Mode) -> Result<()> {
    session
        .connect()
        .await
        .context("failed to reach the signaling relay")?;
    session.create_engine().await?;
    if let Mode::Offer = mode {
        session.create_data_channel().await?;
        session.create_offer().await?;
    }
    Ok(())
}

async fn report_updates(session: Session, mode: Mode) {
    let mut updates = session.subscribe();
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "session updates lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match update {
            SessionUpdate::Latency(rtt) => {
                info!(rtt_ms = format!("{:.3}", rtt.as_secs_f64() * 1000.0), "latency");
            }
            SessionUpdate::Failed(reason) => error!(%reason, "session failed; press ctrl-c to hang up"),
            SessionUpdate::LinkLost(reason) => warn!(?reason, "signaling link lost"),
            SessionUpdate::PeerNull => {
                if let Mode::Answer = mode {
                    info!("remote hung up; waiting for the next offer");
                    if let Err(err) = arm(&session, mode).await {
                        error!(error = %err, "could not re-arm");
                    }
                }
            }
            _ => {}
        }
    }
}
