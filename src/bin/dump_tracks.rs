//! Replays a detections dump through a tracker and prints the tracks.
//!
//! Input lines look like `<timestamp_ms>:<json array of boxes>`; output lines
//! use the same layout with the confirmed tracks of that frame.

use std::io::{BufRead, BufReader, Write};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pitchtrack::session::SessionTracker;
use pitchtrack::{BoundingBox, ByteTracker, PipelineConfig, Tracking};

fn parse_line(line: &str) -> Result<(u64, Vec<BoundingBox>), String> {
    let (ts, vector) = line
        .split_once(':')
        .ok_or_else(|| "expected `:`".to_string())?;

    let ts = ts
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("parse timestamp failed: {}", e))?;
    let dets = serde_json::from_str(vector).map_err(|e| format!("parse json failed: {}", e))?;

    Ok((ts, dets))
}

fn main() -> Result<(), pitchtrack::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut simple = false;
    let mut input = None;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--simple" => simple = true,
            _ => input = Some(arg),
        }
    }

    let Some(input) = input else {
        eprintln!("usage: dump_tracks [--simple] <detections file>");
        std::process::exit(2);
    };

    let config = PipelineConfig::from_env()?;
    let mut tracker: Box<dyn Tracking> = if simple {
        Box::new(SessionTracker::new())
    } else {
        Box::new(ByteTracker::new(config.tracker))
    };

    let dets_file = std::fs::File::open(&input)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut frames = 0u64;

    for (n, line) in BufReader::new(dets_file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let (ts_ms, dets) = match parse_line(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(line = n + 1, "wrong file format: {}", e);
                continue;
            }
        };

        let tracks = tracker.update(&dets, ts_ms as f64 / 1000.0);
        writeln!(out, "{}:{}", ts_ms, serde_json::to_string(&tracks)?)?;
        frames += 1;
    }

    info!(frames, input = %input, "done");

    Ok(())
}
