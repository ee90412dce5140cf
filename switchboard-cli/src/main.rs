//! Switchboard CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::f64::consts::PI;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchboard_codecs::video::yuv420p_size;
use switchboard_codecs::{register_builtin, Law, VideoCodec, VideoEncoder};
use switchboard_core::format::{options, well_known};
use switchboard_core::prelude::*;
use switchboard_core::{MediaStream, PatchStatistics, RecordingOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log filter (e.g. "switchboard=debug"); overrides RUST_LOG
    #[arg(long, env = "SWITCHBOARD_LOG")]
    log: Option<String>,

    /// Manager configuration file (JSON)
    #[arg(short, long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known formats and transcoder pairs
    Formats,

    /// Run a loopback call between two local parties
    Call {
        /// Formats party A offers, in preference order
        #[arg(long, value_delimiter = ',', default_value = "PCM-16")]
        from: Vec<String>,

        /// Formats party B offers, in preference order
        #[arg(long, value_delimiter = ',', default_value = "PCMU")]
        to: Vec<String>,

        /// Audio packets pushed by party A
        #[arg(long, default_value = "50")]
        packets: u32,

        /// Also exchange video frames
        #[arg(long)]
        video: bool,

        /// Record the call to this file
        #[arg(long)]
        record: Option<PathBuf>,

        /// Print patch statistics as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("switchboard=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => ManagerConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ManagerConfig::default(),
    };

    match cli.command {
        Commands::Formats => handle_formats()?,
        Commands::Call {
            from,
            to,
            packets,
            video,
            record,
            json,
        } => {
            handle_call(config, from, to, packets, video, record, json).await?;
        }
    }

    Ok(())
}

fn builtin() -> Result<TranscoderRegistry> {
    let mut registry = TranscoderRegistry::new();
    register_builtin(&mut registry)?;
    for format in well_known::all().iter() {
        registry.register_format(format.clone());
    }
    Ok(registry)
}

fn handle_formats() -> Result<()> {
    let registry = builtin()?;

    println!("Formats:");
    for format in registry.formats().iter() {
        println!(
            "  {:<16} {:<10} pt={:<3} clock={:<6} frame={}B/{}",
            format.name(),
            format.media_type().as_str(),
            format.payload_type(),
            format.clock_rate(),
            format.frame_size(),
            format.frame_time(),
        );
    }

    println!("Transcoders:");
    for (from, to) in registry.pairs() {
        println!("  {from} -> {to}");
    }
    Ok(())
}

async fn handle_call(
    config: ManagerConfig,
    from: Vec<String>,
    to: Vec<String>,
    packets: u32,
    video: bool,
    record: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let mut from_formats = from;
    let mut to_formats = to;
    if video {
        from_formats.push(well_known::H264.to_string());
        to_formats.push(well_known::VP8.to_string());
    }

    let alice = LocalEndpoint::new(LocalEndpointConfig {
        prefix: "a".to_string(),
        formats: from_formats,
        ..Default::default()
    })?;
    let bob = LocalEndpoint::new(LocalEndpointConfig {
        prefix: "b".to_string(),
        formats: to_formats,
        ..Default::default()
    })?;

    let manager = CallManager::new(config, builtin()?);
    manager.attach_endpoint(alice.clone());
    manager.attach_endpoint(bob.clone());

    let mut events = manager.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("event: {event:?}");
            if matches!(event, CallEvent::Cleared { .. }) {
                break;
            }
        }
    });

    let call = manager.set_up_call("a:alice", "b:bob")?;
    println!("Call {} is {:?}", call.token(), call.state());

    if let Some(path) = &record {
        call.start_recording(path, &RecordingOptions { audio: true, video })?;
        println!("Recording to {}", path.display());
    }

    let connections = call.connections();
    let (Some(a), Some(b)) = (connections.first(), connections.get(1)) else {
        bail!("call has fewer than two connections");
    };
    let Some(a) = alice.find_connection(&a.token()) else {
        bail!("party A connection not found");
    };
    let Some(b) = bob.find_connection(&b.token()) else {
        bail!("party B connection not found");
    };

    let audio = a
        .source_stream(1)
        .context("no audio stream opened from party A")?;
    push_tone(&audio, packets)?;
    let expected = packets as usize;
    if let Some(sink) = b.sink_stream(1) {
        let delivered = sink.wait_for_written(expected, Duration::from_secs(5));
        println!(
            "Audio: {} -> {} ({} of {expected} packets delivered{})",
            audio.media_format().name(),
            sink.media_format().name(),
            sink.written_count(),
            if delivered { "" } else { ", timed out" }
        );
    }

    if video {
        let stream = a
            .source_stream(2)
            .context("no video stream opened from party A")?;
        push_pictures(&stream, 5)?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let mut statistics: Vec<PatchStatistics> = Vec::new();
    for connection in [&a, &b] {
        for session in [1, 2] {
            if let Some(patch) = connection.source_stream(session).and_then(|s| s.patch()) {
                statistics.push(patch.statistics());
            }
        }
    }
    print_statistics(&statistics, json)?;

    let (sync, done) = tokio::sync::oneshot::channel();
    call.clear(CallEndReason::LocalUser, Some(sync));
    let reason = done.await.context("call cleared without reporting a reason")?;
    println!("Call cleared: {reason}");
    let _ = printer.await;
    Ok(())
}

fn print_statistics(statistics: &[PatchStatistics], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(statistics)?);
        return Ok(());
    }
    for patch in statistics {
        println!(
            "Patch {} ({}): read={} errors={} bypassed={}",
            patch.source,
            patch.source_format,
            patch.frames_read,
            patch.conversion_errors,
            patch.bypassed_frames
        );
        for sink in &patch.sinks {
            let chain = if sink.transcoders.is_empty() {
                "direct".to_string()
            } else {
                sink.transcoders.join(" | ")
            };
            println!(
                "  -> {} [{}] written={} dropped={}",
                sink.format, chain, sink.written, sink.dropped
            );
        }
    }
    Ok(())
}

/// 440 Hz tone in the stream's own format
fn push_tone(stream: &Arc<MemoryMediaStream>, packets: u32) -> Result<()> {
    let format = stream.media_format();
    let law = if format.is_named(well_known::PCMU) {
        Some(Law::Mu)
    } else if format.is_named(well_known::PCMA) {
        Some(Law::A)
    } else if format.is_named(well_known::PCM16) {
        None
    } else {
        // Opaque filler for codecs without a built-in encoder
        let size = stream.data_size().max(1);
        let ticks = format.frame_time().max(1) * (size / format.frame_size().max(1)).max(1) as u32;
        for i in 0..packets {
            stream.push(MediaFrame::new(format.payload_type(), i * ticks, vec![0x55u8; size]));
        }
        return Ok(());
    };

    let bytes_per_sample = if law.is_some() { 1 } else { 2 };
    let samples = (stream.data_size() / bytes_per_sample).max(1);
    let rate = f64::from(format.clock_rate().max(1));
    for packet in 0..packets {
        let start = packet as usize * samples;
        let mut payload = Vec::with_capacity(samples * bytes_per_sample);
        for n in start..start + samples {
            let value = (f64::sin(2.0 * PI * 440.0 * n as f64 / rate) * 8000.0) as i16;
            match law {
                Some(law) => payload.push(law.encode(value)),
                None => payload.extend_from_slice(&value.to_le_bytes()),
            }
        }
        stream.push(MediaFrame::new(format.payload_type(), start as u32, payload));
    }
    Ok(())
}

/// Moving gradient pictures, encoded when the stream carries a codec
fn push_pictures(stream: &Arc<MemoryMediaStream>, count: u32) -> Result<()> {
    let format = stream.media_format();
    let raw = well_known::get(well_known::YUV420P).context("YUV420P missing")?;
    let width = raw.option_u32(options::FRAME_WIDTH).unwrap_or(352);
    let height = raw.option_u32(options::FRAME_HEIGHT).unwrap_or(288);
    let size = yuv420p_size(width, height)?;

    let codec = if format.is_named(well_known::H264) {
        Some(VideoCodec::H264)
    } else if format.is_named(well_known::VP8) {
        Some(VideoCodec::Vp8)
    } else if format.is_named(well_known::YUV420P) {
        None
    } else {
        bail!("no picture generator for {}", format.name());
    };
    let mut encoder = codec
        .map(|codec| VideoEncoder::new(codec, raw.clone(), format.clone()))
        .transpose()?;

    for i in 0..count {
        let picture: Vec<u8> = (0..size).map(|p| ((p / 16) as u32 + i) as u8).collect();
        let frame = MediaFrame::new(raw.payload_type(), i * format.frame_time(), picture);
        match encoder.as_mut() {
            Some(encoder) => {
                for packet in encoder.convert(&frame)? {
                    stream.push(packet);
                }
            }
            None => stream.push(frame.with_marker(true)),
        }
    }
    Ok(())
}
