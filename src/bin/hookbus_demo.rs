//! hookbus demo
//!
//! Runs one synthetic match through a `HookBridge` backed by the logging broker
//! client and prints the resulting counters.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use hookbus::{
    EventKind, Frame, HookBridge, HookBridgeConfig, LogBroker, Payload, PixelFormat, Point2, Point3,
};

/// Command-line overrides applied on top of the loaded configuration.
#[derive(Default)]
struct Args {
    config: Option<PathBuf>,
    broker: Option<String>,
    topic: Option<String>,
    image_topic: Option<String>,
    frames: u32,
}

fn print_help() {
    println!("hookbus-demo - run a synthetic match through the event pipeline");
    println!();
    println!("USAGE:");
    println!("    hookbus-demo [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>          JSON configuration file");
    println!("    -b, --broker <SERVERS>       Comma-separated bootstrap servers [default: localhost:9092]");
    println!("    -t, --topic <TOPIC>          Topic for scalar events [default: test]");
    println!("    -i, --image-topic <TOPIC>    Topic for camera frames [default: test_image]");
    println!("    -f, --frames <N>             Stereo frames to emit [default: 3]");
    println!("    -h, --help                   Print help information");
}

fn value_for(args: &[String], i: usize, flag: &str) -> Result<String, String> {
    args.get(i + 1)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args() -> Result<Option<Args>, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        frames: 3,
        ..Args::default()
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => parsed.config = Some(PathBuf::from(value_for(&args, i, "--config")?)),
            "--broker" | "-b" => parsed.broker = Some(value_for(&args, i, "--broker")?),
            "--topic" | "-t" => parsed.topic = Some(value_for(&args, i, "--topic")?),
            "--image-topic" | "-i" => parsed.image_topic = Some(value_for(&args, i, "--image-topic")?),
            "--frames" | "-f" => {
                let raw = value_for(&args, i, "--frames")?;
                parsed.frames = raw.parse().map_err(|_| format!("invalid frame count: {raw}"))?;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 2;
    }

    Ok(Some(parsed))
}

fn load_config(args: &Args) -> Result<HookBridgeConfig, hookbus::ConfigError> {
    let mut cfg = match &args.config {
        Some(path) => HookBridgeConfig::from_path(path)?,
        None => HookBridgeConfig::default(),
    };
    if let Some(servers) = &args.broker {
        cfg.broker.bootstrap_servers = servers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(topic) = &args.topic {
        cfg.serializer.events_topic.clone_from(topic);
    }
    if let Some(topic) = &args.image_topic {
        cfg.serializer.images_topic.clone_from(topic);
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Gradient test pattern, shifted per frame so consecutive images differ.
fn synthetic_frame(width: u32, height: u32, shift: u32) -> Frame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            let v = ((x + y + shift) % 256) as u8;
            data.extend_from_slice(&[v, v / 2, 255 - v]);
        }
    }
    Frame::new(width, height, PixelFormat::Rgb8, data)
}

#[allow(clippy::cast_precision_loss)]
fn run_match(bridge: &HookBridge<LogBroker>, frames: u32) -> hookbus::HookResult<()> {
    bridge.emit(EventKind::MatchStart, Payload::None)?;

    for n in 0..frames {
        let t = n as f32;
        bridge.emit(
            EventKind::CameraStream,
            Payload::stereo(synthetic_frame(64, 48, n), synthetic_frame(64, 48, n + 7)),
        )?;
        bridge.emit(
            EventKind::BallPosition,
            Payload::ball_pair(Point2::new(320.0 + t * 4.0, 240.0 - t), Point2::new(300.0 + t * 4.0, 238.0 - t)),
        )?;
    }

    let predicted = (0..5)
        .map(|k| {
            let k = k as f32;
            Point3::new(k * 0.5, 1.2 + k * 0.1, 2.0 - k * 0.2)
        })
        .collect();
    bridge.emit(EventKind::PredictedTrajectory, Payload::Points(predicted))?;
    bridge.emit(EventKind::HitPoint, Payload::Point(Point3::new(2.5, 1.7, 1.0)))?;
    bridge.emit(EventKind::MatchEnd, Payload::None)?;
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => return ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::FAILURE;
        }
    };

    let cfg = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let client = LogBroker::new(cfg.broker.client_id.clone());
    let bridge = match HookBridge::new(cfg, client) {
        Ok(bridge) => bridge,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = run_match(&bridge, args.frames) {
        tracing::warn!(error = %err, "match aborted");
    }
    if !bridge.bus().wait_idle(Duration::from_secs(5)) {
        tracing::warn!("dispatch did not drain before shutdown");
    }
    bridge.shutdown();

    let stats = bridge.stats();
    println!("events emitted:      {}", stats.bus.emitted);
    println!("events dispatched:   {}", stats.bus.dispatched);
    println!("messages published:  {}", stats.serializer.published);
    println!("messages rejected:   {}", stats.serializer.publish_rejected);
    println!("encode failures:     {}", stats.serializer.serialization_failures);
    println!("records delivered:   {}", stats.publisher.delivered);
    println!("records failed:      {}", stats.publisher.failed);

    ExitCode::SUCCESS
}
