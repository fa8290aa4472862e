//! Output files written after a run.

use anyhow::{Context, Result};
use log::{error, info};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use walk_common::{Line, OutputConfig, Particle, PopulationSnapshot};

/// Writes the final population as `x,y` rows (`y` is 1 for top, 0 for bottom).
pub fn save_positions_csv<P: AsRef<Path>>(path: P, particles: &[Particle]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Error creating CSV file '{}'", path.display()))?;
    writer.write_record(["x", "y"])?;
    for particle in particles {
        writer.write_record([format!("{:.4}", particle.position), particle.line.code().to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes per-bucket frequencies normalised by the particle count; bottom-line
/// frequencies are negative so both lines plot on one axis.
pub fn save_histogram_csv<P: AsRef<Path>>(path: P, snapshot: &PopulationSnapshot) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Error creating CSV file '{}'", path.display()))?;
    let total = snapshot.total_particle_count.max(1) as f64;
    writer.write_record(["x", "top_frequency", "bottom_frequency"])?;
    for (&index, counts) in &snapshot.buckets {
        let bottom = counts.get(Line::Bottom) as f64 / total;
        writer.write_record([
            format!("{:.4}", walk_common::bucket_centre(index, snapshot.bucket_width)),
            format!("{:.6}", counts.get(Line::Top) as f64 / total),
            // Avoid printing "-0.000000" for empty bottom buckets.
            format!("{:.6}", if bottom > 0.0 { -bottom } else { 0.0 }),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Serializes recorded snapshots in `format` and returns the file written.
pub fn save_snapshots(
    base_filename: &str,
    format: &str,
    snapshots: &[PopulationSnapshot],
) -> Result<PathBuf> {
    let path = match format {
        "json" => {
            let path = PathBuf::from(format!("{}_snapshots.json", base_filename));
            let mut writer = BufWriter::new(File::create(&path)?);
            serde_json::to_writer(&mut writer, snapshots).context("Error serializing snapshots to JSON")?;
            writer.flush()?;
            path
        }
        "bincode" => {
            let path = PathBuf::from(format!("{}_snapshots.bin", base_filename));
            let writer = BufWriter::new(File::create(&path)?);
            bincode::serialize_into(writer, snapshots).context("Error serializing snapshots to bincode")?;
            path
        }
        "messagepack" => {
            let path = PathBuf::from(format!("{}_snapshots.msgpack", base_filename));
            let mut writer = BufWriter::new(File::create(&path)?);
            rmp_serde::encode::write(&mut writer, snapshots)
                .context("Error serializing snapshots to MessagePack")?;
            writer.flush()?;
            path
        }
        other => anyhow::bail!("Unknown output format: {}", other),
    };
    Ok(path)
}

/// Writes every output enabled in `output`. Failures are logged, not fatal:
/// the simulation itself already completed.
pub fn write_outputs(
    output: &OutputConfig,
    particles: &[Particle],
    final_snapshot: &PopulationSnapshot,
    recorded: &[PopulationSnapshot],
) {
    if output.save_positions {
        let filename = format!("{}_final_positions.csv", output.base_filename);
        match save_positions_csv(&filename, particles) {
            Ok(()) => info!("Final positions saved to {}", filename),
            Err(e) => error!("Error saving final positions: {:#}", e),
        }
    } else {
        info!("Skipping saving final positions as per config.");
    }

    if output.save_histogram {
        let filename = format!("{}_histogram.csv", output.base_filename);
        match save_histogram_csv(&filename, final_snapshot) {
            Ok(()) => info!("Final histogram saved to {}", filename),
            Err(e) => error!("Error saving histogram: {:#}", e),
        }
    }

    if output.save_snapshots {
        let format = output.format.as_deref().unwrap_or("json");
        match save_snapshots(&output.base_filename, format, recorded) {
            Ok(path) => info!("{} snapshots saved to {}", recorded.len(), path.display()),
            Err(e) => error!("Error saving snapshots: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn particles() -> Vec<Particle> {
        vec![
            Particle { position: 1.0, line: Line::Top },
            Particle { position: -1.0, line: Line::Bottom },
            Particle { position: 1.0, line: Line::Bottom },
            Particle { position: 1.0, line: Line::Top },
        ]
    }

    #[test]
    fn positions_csv_has_legacy_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final.csv");
        save_positions_csv(&path, &particles()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "x,y");
        assert_eq!(lines[1], "1.0000,1");
        assert_eq!(lines[2], "-1.0000,0");
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn histogram_csv_signs_bottom_frequencies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hist.csv");
        let snap = PopulationSnapshot::from_particles(2, 1.0, &particles(), 1.0, false);
        save_histogram_csv(&path, &snap).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "x,top_frequency,bottom_frequency");
        assert_eq!(lines[1], "-1.0000,0.000000,-0.250000");
        assert_eq!(lines[2], "1.0000,0.500000,-0.250000");
    }

    #[test]
    fn snapshots_round_trip_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run");
        let snaps = vec![PopulationSnapshot::from_particles(0, 0.0, &particles(), 1.0, false)];
        let path = save_snapshots(base.to_str().unwrap(), "json", &snaps).unwrap();
        let back: Vec<PopulationSnapshot> =
            serde_json::from_reader(File::open(path).unwrap()).unwrap();
        assert_eq!(back, snaps);

        assert!(save_snapshots(base.to_str().unwrap(), "xml", &snaps).is_err());
    }
}
