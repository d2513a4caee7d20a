//! Zero-copy camera preview on KMS overlay planes.

use std::env;
use std::io;
use std::path::PathBuf;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::info;

use kmscam::capture::CaptureStream;
use kmscam::pipeline::{Coordinator, CoordinatorConfig, KmsScanout};
use kmscam::{Config, Rect, StreamConfig};

/// Default layout from the reference hardware: stream 0 in the top-left
/// quadrant, stream 1 mirrored into the opposite one.
fn stream_configs(args: &[String]) -> Vec<StreamConfig> {
    let rects = [Rect::new(0, 0, 480, 270), Rect::new(960, 540, 480, 270)];
    let paths: Vec<PathBuf> = if args.is_empty() {
        vec![PathBuf::from("/dev/video0")]
    } else {
        args.iter().map(PathBuf::from).collect()
    };
    paths
        .into_iter()
        .zip(rects)
        .map(|(device, dst)| StreamConfig { device, dst })
        .collect()
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("kmscam=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("kmscam launching...");

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() > 2 {
        return Err(eyre!("usage: kmscam [capture-device [capture-device]]"));
    }

    let mut config = Config::default();
    config.streams = stream_configs(&args);
    config.validate()?;

    // Negotiate capture formats first: buffer geometry must come from what
    // the drivers accepted, not from what we asked for.
    let mut streams = Vec::with_capacity(config.streams.len());
    let mut accepted = Vec::with_capacity(config.streams.len());
    for stream_cfg in &config.streams {
        let mut stream = CaptureStream::open(&stream_cfg.device)?;
        accepted.push(stream.negotiate_format(config.width, config.height, config.format)?);
        streams.push(stream);
    }

    let scanout = KmsScanout::setup(&config, &accepted)?;

    for (i, stream) in streams.iter_mut().enumerate() {
        let dmabufs = scanout.dmabufs(i);
        stream.bind_buffers(&dmabufs)?;
        stream.start()?;
    }

    let mut coordinator = Coordinator::new(
        streams,
        scanout,
        CoordinatorConfig {
            buffer_count: config.buffer_count,
            reserved_index: Some(0),
            poll_timeout_ms: config.poll_timeout_ms,
            max_consecutive_errors: config.max_consecutive_errors,
        },
    );

    // Pressing enter is the user-exit signal.
    let stdin = io::stdin();
    coordinator.run(&stdin)?;

    info!("kmscam shutting down");
    Ok(())
}
