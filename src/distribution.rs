//! Latency distribution files in the layout consumed by the HDR histogram
//! plotter (https://hdrhistogram.github.io/HdrHistogram/plotFiles.html).

use hdrhistogram::Histogram;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Default percentile scale, dense near the tail.
pub const LOGARITHMIC: &[f64] = &[
    0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 55.0, 60.0, 65.0, 70.0, 75.0, 80.0, 85.0, 90.0, 92.5,
    95.0, 97.5, 98.0, 99.0, 99.5, 99.75, 99.9, 99.95, 99.99, 99.999, 100.0,
];

const HEADER: &str = "Value    Percentile    TotalCount    1/(1-Percentile)\n\n";

/// Write the latency distribution for `histogram` to `path`, one row per
/// requested percentile, in input order. When an uncorrected companion
/// histogram exists (reserved for a future mode that records without
/// coordinated-omission correction), a sibling file with the
/// `.uncorrected` suffix is written alongside.
pub fn write_distribution(
    histogram: &Histogram<u64>,
    uncorrected: Option<&Histogram<u64>>,
    percentiles: &[f64],
    path: &Path,
) -> io::Result<()> {
    write_histogram_file(histogram, percentiles, path)?;

    if let Some(uncorrected) = uncorrected {
        write_histogram_file(uncorrected, percentiles, &uncorrected_path(path))?;
    }

    Ok(())
}

fn write_histogram_file(
    histogram: &Histogram<u64>,
    percentiles: &[f64],
    path: &Path,
) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(HEADER.as_bytes())?;

    for &percentile in percentiles {
        let quantile = percentile / 100.0;
        let value_ms = histogram.value_at_quantile(quantile) as f64 / 1_000_000.0;
        // TotalCount is a literal 0: the plotter ignores the column and
        // downstream tooling expects the layout unchanged.
        writeln!(
            file,
            "{value_ms:.6}    {quantile:.6}        0            {:.6}",
            1.0 / (1.0 - quantile)
        )?;
    }

    file.flush()
}

fn uncorrected_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".uncorrected");
    PathBuf::from(name)
}
