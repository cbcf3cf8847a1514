//! Mover report records.
//!
//! One tab-separated line per mover: run timestamp, sequence number, the
//! three refined objects, then the track parameters and score.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::Local;

use crate::mover::Mover;

/// Format one mover record.
///
/// Layout: `stamp seq {x y ob_size t_count snr flux}x3 motion pa_deg
/// err_mid score status`.
pub fn format_record(stamp: &str, sequence: usize, mover: &Mover) -> String {
    let mut line = format!("{stamp}\t{sequence}");
    for object in &mover.objects {
        line.push_str(&format!(
            "\t{:.2}\t{:.2}\t{}\t{}\t{:.2}\t{:.4}",
            object.x, object.y, object.ob_size, object.t_count, object.snr, object.flux
        ));
    }
    line.push_str(&format!(
        "\t{:.3}\t{:.2}\t{:.3}\t{:.2}\t{}",
        mover.motion,
        mover.pa.to_degrees(),
        mover.err_mid,
        mover.score,
        mover.status
    ));
    line
}

/// Write all movers to `path`, one record per line, best score first.
pub fn write_report(path: &Path, movers: &[Mover]) -> io::Result<()> {
    let stamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let mut out = BufWriter::new(File::create(path)?);
    for (sequence, mover) in movers.iter().enumerate() {
        writeln!(out, "{}", format_record(&stamp, sequence, mover))?;
    }
    out.flush()
}
