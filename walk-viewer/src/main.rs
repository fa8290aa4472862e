use anyhow::Result;
use clap::Parser;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use walk_common::{BucketCounts, ChannelError, ChannelReader, Frame, Histogram, Line};

/// Command-line arguments for the viewer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the shared channel
    #[arg(long, default_value = "particle_shm")]
    name: String,

    /// Directory holding the shared channel
    #[arg(long, default_value = "/dev/shm")]
    directory: PathBuf,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 50)]
    poll_ms: u64,

    /// Seconds to wait for the producer to create the channel
    #[arg(long, default_value_t = 10)]
    attach_timeout_secs: u64,

    /// Exit after this many frames
    #[arg(long)]
    max_frames: Option<u64>,

    /// Width of the longest histogram bar, in characters
    #[arg(long, default_value_t = 30)]
    width: usize,

    /// Number of histogram rows
    #[arg(long, default_value_t = 21)]
    rows: usize,
}

/// Groups histogram entries into `rows` equal-width position ranges.
fn rebin(histogram: &Histogram, rows: usize) -> Vec<(f32, f32, BucketCounts)> {
    let entries = histogram.entries();
    let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
        return Vec::new();
    };
    let rows = rows.max(1);
    let (lo, hi) = (first.x, last.x);
    let span = (hi - lo).max(f32::EPSILON);
    let width = span / rows as f32;

    let mut bins: Vec<(f32, f32, BucketCounts)> = (0..rows)
        .map(|i| (lo + i as f32 * width, lo + (i + 1) as f32 * width, BucketCounts::default()))
        .collect();
    for entry in entries {
        let index = (((entry.x - lo) / width) as usize).min(rows - 1);
        let counts = &mut bins[index].2;
        counts.top += entry.counts.top;
        counts.bottom += entry.counts.bottom;
    }
    bins
}

/// Two-sided text histogram: bottom line to the left of the axis, top line to the right.
fn render(frame: &Frame, rows: usize, width: usize) -> String {
    let bins = rebin(&frame.histogram, rows);
    let peak = bins
        .iter()
        .map(|(_, _, c)| c.top.max(c.bottom))
        .max()
        .unwrap_or(0)
        .max(1);
    let bar = |count: u32| (count as usize * width).div_ceil(peak as usize);

    let totals = frame.histogram.totals();
    let mean = |line| {
        frame
            .histogram
            .mean_position(line)
            .map_or_else(|| "-".to_string(), |m| format!("{:.3}", m))
    };
    let mut out = format!(
        "frame {} | top {} (mean {}) | bottom {} (mean {})\n",
        frame.publication,
        totals.top,
        mean(Line::Top),
        totals.bottom,
        mean(Line::Bottom)
    );
    for (lo, hi, counts) in bins {
        out.push_str(&format!(
            "{:>9.2}..{:<9.2} {:>w$}|{}\n",
            lo,
            hi,
            "#".repeat(bar(counts.bottom)),
            "#".repeat(bar(counts.top)),
            w = width
        ));
    }
    out
}

/// Waits for the producer to create the channel. `None` on timeout.
fn attach(path: &Path, poll: Duration, timeout: Duration) -> Result<Option<ChannelReader>> {
    let start = Instant::now();
    let mut reported = false;
    loop {
        match ChannelReader::attach(path) {
            // Left behind by a producer that was killed; a new one will replace it.
            Ok(reader) if reader.producer_gone() => debug!("Channel at {} is abandoned.", path.display()),
            Ok(reader) => return Ok(Some(reader)),
            Err(ChannelError::NotFound { .. }) => {
                if !reported {
                    warn!("Shared channel {} not available yet; waiting.", path.display());
                    reported = true;
                }
            }
            // The producer may still be sizing the region.
            Err(ChannelError::RegionSize { len }) => debug!("Region not ready ({} bytes).", len),
            Err(e) => return Err(e.into()),
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(poll);
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let path = args.directory.join(args.name.trim_start_matches('/'));
    let poll = Duration::from_millis(args.poll_ms.max(1));

    let Some(mut reader) = attach(&path, poll, Duration::from_secs(args.attach_timeout_secs))? else {
        info!("No producer found at {}; nothing to show.", path.display());
        return Ok(());
    };
    info!(
        "Attached to {} ({} records).",
        reader.path().display(),
        reader.capacity()
    );

    let mut frames = 0u64;
    loop {
        match reader.try_read() {
            Ok(Some(frame)) => {
                print!("{}", render(&frame, args.rows, args.width));
                frames += 1;
                if args.max_frames.is_some_and(|max| frames >= max) {
                    break;
                }
                continue;
            }
            Ok(None) => {
                if reader.producer_gone() {
                    // Pick up a frame published just before the unlink.
                    if let Ok(Some(frame)) = reader.try_read() {
                        print!("{}", render(&frame, args.rows, args.width));
                        frames += 1;
                    }
                    info!("Producer closed the channel; end of stream.");
                    break;
                }
            }
            Err(e) if e.is_protocol() => warn!("Discarded frame: {}", e),
            Err(e) => {
                error!("Shared channel failed: {}", e);
                return Err(e.into());
            }
        }
        thread::sleep(poll);
    }

    info!(
        "Viewed {} frames ({} torn copies retried, {} malformed frames discarded).",
        frames,
        reader.torn_reads(),
        reader.discarded()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(points: &[(f32, Line, u32)]) -> Frame {
        Frame {
            publication: 1,
            histogram: Histogram::from_points(points.iter().copied()),
        }
    }

    #[test]
    fn rebin_preserves_totals() {
        let f = frame(&[(-2.0, Line::Top, 3), (0.0, Line::Bottom, 5), (2.0, Line::Top, 1), (2.0, Line::Bottom, 2)]);
        let bins = rebin(&f.histogram, 4);
        assert_eq!(bins.len(), 4);
        let top: u32 = bins.iter().map(|b| b.2.top).sum();
        let bottom: u32 = bins.iter().map(|b| b.2.bottom).sum();
        assert_eq!((top, bottom), (4, 7));
        assert_eq!(bins[3].2, BucketCounts { top: 1, bottom: 2 });
    }

    #[test]
    fn rebin_single_position() {
        let f = frame(&[(1.5, Line::Top, 2)]);
        let bins = rebin(&f.histogram, 3);
        assert_eq!(bins[0].2.top, 2);
        assert!(rebin(&Histogram::default(), 3).is_empty());
    }

    #[test]
    fn render_has_header_and_rows() {
        let text = render(&frame(&[(-1.0, Line::Bottom, 4), (1.0, Line::Top, 2)]), 2, 8);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("frame 1 | top 2"));
        assert!(lines[1].ends_with("########|"));
        assert!(lines[2].ends_with("|####"));
    }
}
