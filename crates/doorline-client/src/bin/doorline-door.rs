use clap::Parser;
use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use webrtc::media::Sample;

use doorline_client::{
    CallController, CallDeps, CallHandle, CallStatus, ControllerOptions, LocalStream,
    MediaConstraints, MediaView, RemoteTrack, RtcPeerFactory, SampleCapture, SignalingLink,
    TrackKind, OPUS_SILENCE_FRAME,
};
use doorline_common::config::{ALLOW_INSECURE_CAPTURE_ENV, ICE_SERVERS_ENV, SIGNALING_URL_ENV};
use doorline_common::helpers::split_list;
use doorline_common::{DoorConfig, Error};

const SILENCE_FRAME_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "doorline-door")]
struct Args {
    /// Hub signaling endpoint (ws:// or wss://)
    #[arg(long, env = SIGNALING_URL_ENV)]
    signaling_url: Option<String>,
    /// ICE server URLs, comma or semicolon separated; may be repeated
    #[arg(long, env = ICE_SERVERS_ENV)]
    ice_servers: Vec<String>,
    /// Allow capture even when the signaling endpoint is not a secure context
    #[arg(
        long,
        env = ALLOW_INSECURE_CAPTURE_ENV,
        default_value_t = false,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    allow_insecure_capture: bool,
    /// Ring as soon as the door is connected
    #[arg(long, default_value_t = false)]
    ring: bool,
    /// Capture audio only
    #[arg(long, default_value_t = false)]
    no_video: bool,
    /// Show the local preview from the start
    #[arg(long, default_value_t = false)]
    preview: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleCommand {
    Ring,
    Hangup,
    Preview(bool),
    Status,
    Quit,
}

fn parse_console_line(line: &str) -> Result<ConsoleCommand, String> {
    let mut parts = line.split_whitespace();
    let command = parts.next().ok_or_else(|| "empty command".to_string())?;
    let parsed = match command.to_ascii_lowercase().as_str() {
        "ring" => ConsoleCommand::Ring,
        "hangup" => ConsoleCommand::Hangup,
        "status" => ConsoleCommand::Status,
        "quit" | "exit" => ConsoleCommand::Quit,
        "preview" => match parts.next() {
            Some("on") => ConsoleCommand::Preview(true),
            Some("off") => ConsoleCommand::Preview(false),
            _ => return Err("usage: preview <on|off>".into()),
        },
        other => return Err(format!("unknown command `{other}`")),
    };
    if parts.next().is_some() {
        return Err(format!("unexpected arguments after `{command}`"));
    }
    Ok(parsed)
}

fn build_config(args: &Args) -> Result<DoorConfig, Error> {
    let url = args
        .signaling_url
        .as_deref()
        .ok_or_else(|| Error::config(format!("{SIGNALING_URL_ENV} must be set")))?;
    let ice_servers = args.ice_servers.iter().flat_map(|v| split_list(v)).collect();
    Ok(DoorConfig::new(url)?
        .with_ice_servers(ice_servers)
        .with_insecure_capture(args.allow_insecure_capture))
}

/// Prints where media would be rendered on a door with a screen.
struct ConsoleView;

impl MediaView for ConsoleView {
    fn show_preview(&mut self, stream: Option<&LocalStream>) {
        match stream {
            Some(stream) => info!(stream = %stream.id(), "local preview on"),
            None => info!("local preview off"),
        }
    }

    fn attach_remote(&mut self, track: RemoteTrack) {
        info!(kind = %track.kind, stream = %track.stream_id, "playing remote media");
    }

    fn detach_remote(&mut self) {
        info!("remote media stopped");
    }
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<ConsoleCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        eprintln!("Commands: ring | hangup | preview <on|off> | status | quit");
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => match parse_console_line(&line) {
                    Ok(cmd) => {
                        if tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    Err(err) => eprintln!("invalid command `{}`: {}", line.trim(), err),
                },
                Err(err) => {
                    eprintln!("stdin read error: {}", err);
                    break;
                }
            }
        }
    });
    rx
}

/// Keeps the audio track alive with Opus silence while a stream is open.
fn spawn_silence_feeder(streams: watch::Receiver<Option<LocalStream>>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SILENCE_FRAME_INTERVAL);
        let sample = Sample {
            data: bytes::Bytes::from_static(&OPUS_SILENCE_FRAME),
            duration: SILENCE_FRAME_INTERVAL,
            ..Default::default()
        };
        loop {
            tick.tick().await;
            let stream = streams.borrow().clone();
            let Some(stream) = stream else {
                continue;
            };
            for track in stream.tracks().iter().filter(|t| t.kind() == TrackKind::Audio) {
                if let Err(e) = track.write_sample(&sample).await {
                    debug!("silence frame dropped: {}", e);
                }
            }
        }
    });
}

fn describe(status: &CallStatus) -> String {
    let mut line = format!(
        "[{}] link={} media={} ice={} signaling={}",
        status.phase(),
        if status.link_open { "open" } else { "closed" },
        if status.media_ready { "ready" } else { "off" },
        status.ice_state,
        status.signaling_state,
    );
    if status.negotiation_failures > 0 {
        line.push_str(&format!(" failures={}", status.negotiation_failures));
    }
    if let Some(err) = &status.last_error {
        line.push_str(&format!(" error=\"{err}\""));
    }
    line
}

fn spawn_status_printer(mut status: watch::Receiver<CallStatus>) {
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let line = describe(&status.borrow_and_update());
            println!("{line}");
        }
    });
}

fn spawn_ring(handle: &CallHandle) {
    let handle = handle.clone();
    tokio::spawn(async move {
        if let Err(err) = handle.ring().await {
            eprintln!("{err}");
        }
    });
}

async fn run(args: Args, config: DoorConfig) -> anyhow::Result<()> {
    let (link, events) = SignalingLink::connect(config.signaling_url.as_str()).await?;

    let capture = Arc::new(SampleCapture::new());
    spawn_silence_feeder(capture.subscribe());

    let mut options = ControllerOptions::from_config(&config);
    options.show_preview = args.preview;
    if args.no_video {
        options.constraints = MediaConstraints::audio_only();
    }
    if !options.secure_context {
        eprintln!(
            "warning: {} is not a secure context; calls will be refused (set {} to override)",
            config.signaling_url, ALLOW_INSECURE_CAPTURE_ENV
        );
    }

    let deps = CallDeps {
        capture,
        peers: Arc::new(RtcPeerFactory::new(config.ice_servers.clone())),
        view: Box::new(ConsoleView),
    };
    let handle = CallController::start(link, events, deps, options).await?;
    spawn_status_printer(handle.subscribe());
    println!("{}", describe(&handle.status()));

    if args.ring {
        spawn_ring(&handle);
    }

    let mut commands = spawn_stdin_reader();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            command = commands.recv() => match command {
                Some(ConsoleCommand::Ring) => spawn_ring(&handle),
                Some(ConsoleCommand::Hangup) => handle.hangup().await,
                Some(ConsoleCommand::Preview(on)) => handle.set_preview(on).await,
                Some(ConsoleCommand::Status) => {
                    println!("{}", serde_json::to_string_pretty(&handle.status())?);
                }
                Some(ConsoleCommand::Quit) | None => break,
            },
        }
    }

    handle.hangup().await;
    handle.shutdown().await;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    doorline_common::init_tracing();

    let args = Args::parse();
    let config = build_config(&args)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args, config))
}
