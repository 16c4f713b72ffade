// store.rs — CSV image store: load an integer matrix from comma-separated
// text, write a same-shaped matrix back.
//
// FILE FORMAT
// ───────────
//   - one image row per line, no header, no quoting;
//   - values are base-10 numbers separated by ',';
//   - output rows have exactly `width` values, no trailing comma, and every
//     row (including the last) ends with '\n'.
//
// TOLERANCE
// ─────────
// Input is tokenised like strtok(line, ","): empty tokens (",,") are
// skipped, tokens past `width` and lines past `height` are ignored. The
// image is zeroed before parsing, so cells a short row or a short file
// leaves behind are always 0.
//
// Under `RowPolicy::Lenient` a short row, a short file or an unparsable
// token is reported through the probe and loading continues. Under
// `RowPolicy::Strict` the first such problem is returned as an error.
//
// Lines are read into a growable buffer bounded by `max_line_bytes`; a
// longer line is an error rather than a silent truncation.
//
// OUTPUT ATOMICITY
// ────────────────
// `save` writes into a temporary file next to the destination and renames
// it into place, so a failure at any point leaves no partial output file.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::image::{Image, Pixel};
use crate::probe::{self, StatusCode};

/// How to treat rows that don't carry `width` valid values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowPolicy {
    /// Zero-fill, report, keep going.
    #[default]
    Lenient,
    /// Fail on the first malformed row.
    Strict,
}

/// Parser limits and policy.
#[derive(Debug, Clone, Copy)]
pub struct CsvLimits {
    /// Longest accepted line in bytes, excluding the line terminator.
    pub max_line_bytes: usize,
    pub row_policy: RowPolicy,
}

impl Default for CsvLimits {
    fn default() -> Self {
        CsvLimits {
            // 1920 columns of "-2147483648," is ~23 KiB; leave ample room.
            max_line_bytes: 1 << 20,
            row_policy: RowPolicy::Lenient,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CsvError {
    #[error("failed to open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to read input: {0}")]
    Read(#[from] io::Error),

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("line {line}: {message}")]
    Format { line: usize, message: String },

    #[error("line {line} is longer than {limit} bytes")]
    LineTooLong { line: usize, limit: usize },
}

impl StatusCode for CsvError {
    fn code(&self) -> i32 {
        match self {
            CsvError::Open { .. } => -1,
            CsvError::Read(_) => -2,
            CsvError::Write { .. } => -3,
            CsvError::Format { .. } => -4,
            CsvError::LineTooLong { .. } => -5,
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load a `width × height` image from a CSV file.
pub fn load<T: Pixel>(
    path: impl AsRef<Path>,
    width: usize,
    height: usize,
    limits: &CsvLimits,
) -> Result<Image<T>, CsvError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| CsvError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let img = read_csv(BufReader::new(file), width, height, limits)?;
    tracing::debug!("loaded {}×{} image from {}", width, height, path.display());
    Ok(img)
}

/// Parse an image from in-memory CSV text.
pub fn parse_str<T: Pixel>(
    text: &str,
    width: usize,
    height: usize,
    limits: &CsvLimits,
) -> Result<Image<T>, CsvError> {
    read_csv(text.as_bytes(), width, height, limits)
}

/// Parse an image from any buffered reader.
pub fn read_csv<T: Pixel, R: BufRead>(
    mut reader: R,
    width: usize,
    height: usize,
    limits: &CsvLimits,
) -> Result<Image<T>, CsvError> {
    let mut img = Image::new(width, height);
    let mut buf: Vec<u8> = Vec::new();
    let mut row = 0usize;

    while row < height {
        let line_no = row + 1;
        buf.clear();
        // Read at most one byte past the limit: enough to tell an
        // over-long line from one that ends exactly at the limit.
        let n = reader
            .by_ref()
            // Room for the ceiling plus a CRLF terminator.
            .take(limits.max_line_bytes as u64 + 2)
            .read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        strip_line_ending(&mut buf);
        if buf.len() > limits.max_line_bytes {
            return Err(CsvError::LineTooLong {
                line: line_no,
                limit: limits.max_line_bytes,
            });
        }

        let text = String::from_utf8_lossy(&buf);
        let dst = img.row_mut(row);
        let mut col = 0usize;
        for token in text.split(',').filter(|t| !t.is_empty()).take(width) {
            match T::parse_token(token) {
                Some(v) => dst[col] = v,
                None => malformed(
                    limits.row_policy,
                    line_no,
                    format!("column {}: cannot parse {:?}, stored 0", col + 1, token),
                )?,
            }
            col += 1;
        }
        if col < width {
            malformed(
                limits.row_policy,
                line_no,
                format!("expected {width} values, found {col}; remaining cells are 0"),
            )?;
        }
        row += 1;
    }

    if row < height {
        malformed(
            limits.row_policy,
            row + 1,
            format!("expected {height} rows, found {row}; remaining rows are 0"),
        )?;
    }

    Ok(img)
}

/// Apply the row policy to one malformed-input finding.
fn malformed(policy: RowPolicy, line: usize, message: String) -> Result<(), CsvError> {
    let err = CsvError::Format { line, message };
    match policy {
        RowPolicy::Strict => Err(err),
        RowPolicy::Lenient => {
            probe::report_error(&err, "reading input image");
            Ok(())
        }
    }
}

fn strip_line_ending(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Write `img` to `path` as CSV.
///
/// The destination only appears once every row has been written.
pub fn save<T: Pixel>(path: impl AsRef<Path>, img: &Image<T>) -> Result<(), CsvError> {
    let path = path.as_ref();
    let write_err = |source: io::Error| CsvError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    // tempfile creates 0600 files; ask for 0666 so the umask applies as it
    // would to a plain create.
    let mut builder = tempfile::Builder::new();
    builder.prefix(".gpufilter-");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    let mut tmp = builder.tempfile_in(dir).map_err(write_err)?;
    {
        let mut w = io::BufWriter::new(tmp.as_file_mut());
        write_csv(&mut w, img).map_err(write_err)?;
        w.flush().map_err(write_err)?;
    }
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    tracing::debug!("saved {}×{} image to {}", img.width(), img.height(), path.display());
    Ok(())
}

/// Serialise `img` into any writer.
pub fn write_csv<T: Pixel, W: Write>(writer: &mut W, img: &Image<T>) -> io::Result<()> {
    let mut line = String::new();
    for row in img.rows() {
        line.clear();
        for (i, v) in row.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            // Writing into a String cannot fail.
            let _ = write!(line, "{v}");
        }
        line.push('\n');
        writer.write_all(line.as_bytes())?;
    }
    Ok(())
}

/// Serialise `img` to a `String`.
pub fn to_csv_string<T: Pixel>(img: &Image<T>) -> String {
    let mut out = Vec::with_capacity(img.len() * 4);
    // Vec<u8> as a writer never fails.
    let _ = write_csv(&mut out, img);
    String::from_utf8_lossy(&out).into_owned()
}
