//! Human-readable and CSV output.

use std::fmt;
use std::io::Write;

use crate::error::Result;
use crate::measure::{Measurement, Summary};
use crate::pattern::{CommMatrix, Footprint};
use crate::registry::LedgerEntry;

/// A byte count in decimal units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSize(pub usize);

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0 as f64;
        if bytes < 1e3 {
            write!(f, "{} bytes", self.0)
        } else if bytes < 1e6 {
            write!(f, "{:.4} KB", bytes / 1e3)
        } else if bytes < 1e9 {
            write!(f, "{:.4} MB", bytes / 1e6)
        } else if bytes < 1e12 {
            write!(f, "{:.4} GB", bytes / 1e9)
        } else {
            write!(f, "{:.4} TB", bytes / 1e12)
        }
    }
}

pub fn format_size(bytes: usize) -> DataSize {
    DataSize(bytes)
}

/// Receiver rows by sender columns, `1` where a pair communicates.
pub fn write_matrix<W: Write>(out: &mut W, matrix: &CommMatrix) -> Result<()> {
    for receiver in 0..matrix.size() {
        let row: Vec<&str> = (0..matrix.size())
            .map(|sender| if matrix.get(sender, receiver) > 0 { "1" } else { "." })
            .collect();
        writeln!(out, "{}", row.join(" "))?;
    }
    Ok(())
}

pub fn write_ledger<W: Write>(out: &mut W, ledger: &[LedgerEntry], elem_size: usize) -> Result<()> {
    for (rank, entry) in ledger.iter().enumerate() {
        writeln!(
            out,
            "proc {rank}: {} pieces count {} {}",
            entry.pieces,
            entry.count,
            format_size(entry.count.saturating_mul(elem_size))
        )?;
    }
    Ok(())
}

pub fn write_footprint<W: Write>(out: &mut W, footprint: &Footprint, elem_size: usize) -> Result<()> {
    writeln!(
        out,
        "send footprint: {} {}",
        footprint.send,
        format_size(footprint.send.saturating_mul(elem_size))
    )?;
    writeln!(
        out,
        "recv footprint: {} {}",
        footprint.recv,
        format_size(footprint.recv.saturating_mul(elem_size))
    )?;
    writeln!(out)?;
    Ok(())
}

/// Per-rank device memory and the total.
pub fn write_memory<W: Write>(out: &mut W, per_rank: &[usize]) -> Result<()> {
    writeln!(out, "memory report:")?;
    for (rank, bytes) in per_rank.iter().enumerate() {
        writeln!(out, "proc: {rank} memory {}", format_size(*bytes))?;
    }
    writeln!(out, "total memory: {}", format_size(per_rank.iter().sum()))?;
    writeln!(out)?;
    Ok(())
}

fn marker(iter: usize, n: usize) -> &'static str {
    if iter == 0 {
        " -> min"
    } else if iter == n / 2 {
        " -> median"
    } else if iter == n - 1 {
        " -> max"
    } else {
        ""
    }
}

fn write_stat<W: Write>(out: &mut W, label: &str, seconds: f64, bytes: usize) -> Result<()> {
    let data = bytes as f64;
    writeln!(
        out,
        "{label}: {:.4e} us, {:.4e} ms/GB, {:.4e} GB/s",
        seconds * 1e6,
        seconds / data * 1e12,
        data / seconds / 1e9
    )?;
    Ok(())
}

/// Sorted iterations followed by min/median/max/mean with throughput.
pub fn write_measurement<W: Write>(out: &mut W, m: &Measurement) -> Result<()> {
    let n = m.iterations();
    writeln!(out, "{n} measurement iterations (sorted):")?;
    for (iter, (issue, total)) in m.issue.iter().zip(&m.total).enumerate() {
        writeln!(
            out,
            "start: {:.4e} time: {:.4e}{}",
            issue * 1e6,
            total * 1e6,
            marker(iter, n)
        )?;
    }
    writeln!(out)?;

    let Summary {
        min,
        median,
        max,
        mean,
    } = m.summary();
    writeln!(out, "data: {}", format_size(m.bytes))?;
    write_stat(out, "minTime", min, m.bytes)?;
    write_stat(out, "medTime", median, m.bytes)?;
    write_stat(out, "maxTime", max, m.bytes)?;
    write_stat(out, "avgTime", mean, m.bytes)?;
    writeln!(out)?;
    Ok(())
}

/// Sorted samples as CSV, times in seconds.
///
/// ```csv
/// Iteration,Issue,Total
/// 0,1.2e-6,8.1e-5
/// ```
pub fn write_csv<W: Write>(out: &mut W, m: &Measurement) -> Result<()> {
    writeln!(out, "Iteration,Issue,Total")?;
    for (iter, (issue, total)) in m.issue.iter().zip(&m.total).enumerate() {
        writeln!(out, "{iter},{issue},{total}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_switch_units_at_decimal_boundaries() {
        assert_eq!(format_size(999).to_string(), "999 bytes");
        assert_eq!(format_size(1000).to_string(), "1.0000 KB");
        assert_eq!(format_size(4096).to_string(), "4.0960 KB");
        assert_eq!(format_size(2_500_000).to_string(), "2.5000 MB");
        assert_eq!(format_size(4_000_000_000).to_string(), "4.0000 GB");
        assert_eq!(format_size(1_000_000_000_000).to_string(), "1.0000 TB");
    }

    #[test]
    fn measurement_table_marks_order_statistics() {
        let m = Measurement::new(vec![1e-6, 2e-6, 3e-6], vec![3e-6, 1e-6, 2e-6], 4096).unwrap();
        let mut out = Vec::new();
        write_measurement(&mut out, &m).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "3 measurement iterations (sorted):");
        assert!(lines[1].ends_with("-> min"));
        assert!(lines[2].ends_with("-> median"));
        assert!(lines[3].ends_with("-> max"));
        assert!(text.contains("data: 4.0960 KB"));
        assert!(text.contains("medTime: 2.0000e0 us"));
    }

    #[test]
    fn csv_has_one_row_per_iteration() {
        let m = Measurement::new(vec![0.5, 0.25], vec![2.0, 1.0], 8).unwrap();
        let mut out = Vec::new();
        write_csv(&mut out, &m).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Iteration,Issue,Total\n0,0.25,1\n1,0.5,2\n"
        );
    }

    #[test]
    fn memory_total_is_summed() {
        let mut out = Vec::new();
        write_memory(&mut out, &[1000, 500]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("proc: 1 memory 500 bytes"));
        assert!(text.contains("total memory: 1.5000 KB"));
    }
}
